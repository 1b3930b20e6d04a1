//! Positional `{{n}}` placeholder handling for provider-registered message
//! templates.

use crate::domain::template::MessageTemplate;
use crate::errors::CommsError;

/// Highest `{{n}}` index found in the body, 0 when the body carries no
/// placeholders. Indices are 1-based; malformed or non-numeric braces are
/// ignored.
pub fn count_variables(body: &str) -> u32 {
    let mut max_index = 0u32;
    let mut rest = body;
    while let Some(open) = rest.find("{{") {
        rest = &rest[open + 2..];
        let Some(close) = rest.find("}}") else {
            break;
        };
        if let Ok(index) = rest[..close].trim().parse::<u32>() {
            max_index = max_index.max(index);
        }
        rest = &rest[close + 2..];
    }
    max_index
}

/// Substitutes `{{i}}` tokens from `values` (1-based). Placeholders without a
/// non-blank value are left literal so a preview shows exactly what is still
/// missing.
pub fn preview(body: &str, values: &[String]) -> String {
    let mut rendered = body.to_string();
    for (position, value) in values.iter().enumerate() {
        if value.trim().is_empty() {
            continue;
        }
        let token = format!("{{{{{}}}}}", position + 1);
        rendered = rendered.replace(&token, value);
    }
    rendered
}

/// Rejects a send when the template is unapproved or any positional variable
/// in `1..=count` is missing or blank.
pub fn validate_send(template: &MessageTemplate, values: &[String]) -> Result<(), CommsError> {
    if !template.is_approved() {
        return Err(CommsError::TemplateNotApproved { name: template.name.clone() });
    }
    let required = count_variables(&template.body);
    for index in 1..=required {
        let filled = values
            .get(index as usize - 1)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        if !filled {
            return Err(CommsError::IncompleteVariables { index });
        }
    }
    Ok(())
}
