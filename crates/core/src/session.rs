//! Per-viewing-session UI state for the conversation panel.
//!
//! One `SessionState` exists per open panel. It remembers the active channel
//! for each channel type, the active thread for the active channel, and the
//! thread that was active on a channel *before* the user switched away, so
//! switching back restores where they left off instead of defaulting to the
//! most recent thread. All of this is in-memory, cooperative state; nothing
//! here touches storage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::channel::{ChannelId, ChannelType};
use crate::domain::subthread::ConversationThreadId;
use crate::domain::thread::ThreadId;

/// Timeline presentation mode. `Live` auto-updates on new messages; `History`
/// is a frozen view of a past sub-thread, flagged so the caller suppresses
/// live-refresh behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    #[default]
    Live,
    History,
}

#[derive(Clone, Debug, Default)]
pub struct SessionState {
    active_channel_by_type: HashMap<ChannelType, ChannelId>,
    active_channel: Option<ChannelId>,
    active_thread: Option<ThreadId>,
    remembered_threads: HashMap<ChannelId, ThreadId>,
    viewing_sub_thread: Option<ConversationThreadId>,
    view_mode: ViewMode,
    last_refresh_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_channel(&self) -> Option<&ChannelId> {
        self.active_channel.as_ref()
    }

    pub fn active_channel_for_type(&self, channel_type: ChannelType) -> Option<&ChannelId> {
        self.active_channel_by_type.get(&channel_type)
    }

    pub fn active_thread(&self) -> Option<&ThreadId> {
        self.active_thread.as_ref()
    }

    pub fn remembered_thread(&self, channel: &ChannelId) -> Option<&ThreadId> {
        self.remembered_threads.get(channel)
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    pub fn viewing_sub_thread(&self) -> Option<&ConversationThreadId> {
        self.viewing_sub_thread.as_ref()
    }

    /// True when this session has `thread` open in live mode, which is what
    /// suppresses the unread flag on inbound delivery.
    pub fn is_viewing_live(&self, thread: &ThreadId) -> bool {
        self.view_mode == ViewMode::Live && self.active_thread.as_ref() == Some(thread)
    }

    /// Makes `channel` the active channel. The current (channel, thread) pair
    /// is archived into the remembered map before the active channel id is
    /// mutated; reversing that order would lose the value being archived.
    /// Returns the remembered thread for the new channel, which the caller
    /// must validate against the thread store before restoring.
    pub fn begin_channel_switch(
        &mut self,
        channel_type: ChannelType,
        channel: ChannelId,
    ) -> Option<ThreadId> {
        if let (Some(previous_channel), Some(previous_thread)) =
            (self.active_channel.clone(), self.active_thread.clone())
        {
            self.remembered_threads.insert(previous_channel, previous_thread);
        }

        self.active_channel_by_type.insert(channel_type, channel.clone());
        let remembered = self.remembered_threads.get(&channel).cloned();
        self.active_channel = Some(channel);
        self.active_thread = None;
        self.viewing_sub_thread = None;
        self.view_mode = ViewMode::Live;
        remembered
    }

    /// Completes a switch or a direct thread selection. Selecting a thread
    /// always lands in live mode.
    pub fn set_active_thread(&mut self, thread: Option<ThreadId>) {
        self.active_thread = thread;
        self.viewing_sub_thread = None;
        self.view_mode = ViewMode::Live;
    }

    /// Selects which sub-thread the timeline shows. `None` or the currently
    /// active sub-thread means live mode; a past sub-thread freezes the view.
    pub fn set_viewing(
        &mut self,
        requested: Option<ConversationThreadId>,
        active_sub_thread: Option<&ConversationThreadId>,
    ) -> ViewMode {
        self.view_mode = match &requested {
            None => ViewMode::Live,
            Some(id) if Some(id) == active_sub_thread => ViewMode::Live,
            Some(_) => ViewMode::History,
        };
        self.viewing_sub_thread = requested;
        self.view_mode
    }

    /// Drops every reference to a deleted thread, including the remembered
    /// entry for its channel.
    pub fn forget_thread(&mut self, thread: &ThreadId) {
        if self.active_thread.as_ref() == Some(thread) {
            self.active_thread = None;
            self.viewing_sub_thread = None;
            self.view_mode = ViewMode::Live;
        }
        self.remembered_threads.retain(|_, remembered| remembered != thread);
    }

    /// Records a poll and returns the previous poll time, the lower bound for
    /// the change set.
    pub fn note_refresh(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.last_refresh_at.replace(now)
    }

    pub fn last_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.last_refresh_at
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionState, ViewMode};
    use crate::domain::channel::{ChannelId, ChannelType};
    use crate::domain::subthread::ConversationThreadId;
    use crate::domain::thread::ThreadId;

    fn channel(id: &str) -> ChannelId {
        ChannelId(id.to_string())
    }

    fn thread(id: &str) -> ThreadId {
        ThreadId(id.to_string())
    }

    #[test]
    fn switching_back_returns_the_archived_thread() {
        let mut session = SessionState::new();

        session.begin_channel_switch(ChannelType::Email, channel("ch-email"));
        session.set_active_thread(Some(thread("th-email-1")));

        let restored = session.begin_channel_switch(ChannelType::WhatsApp, channel("ch-wa"));
        assert_eq!(restored, None, "no thread was remembered for the whatsapp channel yet");
        session.set_active_thread(Some(thread("th-wa-1")));

        let restored = session.begin_channel_switch(ChannelType::Email, channel("ch-email"));
        assert_eq!(restored, Some(thread("th-email-1")));
    }

    #[test]
    fn archive_happens_before_the_active_channel_changes() {
        let mut session = SessionState::new();
        session.begin_channel_switch(ChannelType::Email, channel("ch-email"));
        session.set_active_thread(Some(thread("th-1")));

        // Switching away must file th-1 under ch-email, not under the channel
        // being switched to.
        session.begin_channel_switch(ChannelType::WhatsApp, channel("ch-wa"));
        assert_eq!(session.remembered_thread(&channel("ch-email")), Some(&thread("th-1")));
        assert_eq!(session.remembered_thread(&channel("ch-wa")), None);
        assert_eq!(session.active_thread(), None);
    }

    #[test]
    fn viewing_active_sub_thread_stays_live() {
        let mut session = SessionState::new();
        session.set_active_thread(Some(thread("th-1")));

        let active = ConversationThreadId("ct-active".to_string());
        let mode = session.set_viewing(Some(active.clone()), Some(&active));
        assert_eq!(mode, ViewMode::Live);
        assert!(session.is_viewing_live(&thread("th-1")));
    }

    #[test]
    fn viewing_past_sub_thread_freezes_the_view() {
        let mut session = SessionState::new();
        session.set_active_thread(Some(thread("th-1")));

        let past = ConversationThreadId("ct-past".to_string());
        let active = ConversationThreadId("ct-active".to_string());
        let mode = session.set_viewing(Some(past), Some(&active));
        assert_eq!(mode, ViewMode::History);
        assert!(!session.is_viewing_live(&thread("th-1")));
    }

    #[test]
    fn forget_thread_clears_active_and_remembered_state() {
        let mut session = SessionState::new();
        session.begin_channel_switch(ChannelType::Email, channel("ch-email"));
        session.set_active_thread(Some(thread("th-1")));
        session.begin_channel_switch(ChannelType::WhatsApp, channel("ch-wa"));

        session.forget_thread(&thread("th-1"));
        assert_eq!(session.remembered_thread(&channel("ch-email")), None);
    }

    #[test]
    fn note_refresh_returns_previous_poll_time() {
        let mut session = SessionState::new();
        let first = chrono::Utc::now();
        assert_eq!(session.note_refresh(first), None);

        let second = first + chrono::Duration::seconds(30);
        assert_eq!(session.note_refresh(second), Some(first));
    }
}
