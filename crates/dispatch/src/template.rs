//! `{{key}}` personalization.

use std::collections::BTreeMap;

/// Substitute `{{key}}` placeholders from the variable map.
///
/// Unknown placeholders stay verbatim so a typo is visible to the agent
/// instead of silently vanishing from the message.
#[must_use]
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match variables.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    },
                }
                rest = &after[end + 2..];
            },
            None => {
                out.push_str("{{");
                rest = after;
            },
        }
    }

    out.push_str(rest);
    out
}
