use loom_core::model::TemplateOption;
use serde_json::Value;

use crate::{best_match_indices, SelectorError};

/// What a resource with template options resolves to for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionChoice<'a> {
    /// Stamp the named template.
    Template(&'a str),
    /// Forward the named input as this resource's output.
    PassThrough(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    /// Zero (without a pass-through) or several options matched.
    #[error("expected exactly 1 option to match, found [{}] matching options {}", .0.len(), list(.0))]
    Match(Vec<String>),
    #[error("error matching against template option [{option}]: {source}")]
    Evaluate {
        option: String,
        #[source]
        source: SelectorError,
    },
}

fn list(names: &[String]) -> String {
    if names.is_empty() {
        String::new()
    } else {
        format!("[{}]", names.join(", "))
    }
}

/// Choose among template options: exactly one best match wins; no match falls back to
/// the pass-through option when one is declared.
pub fn choose_option<'a>(options: &'a [TemplateOption], owner: &Value) -> Result<OptionChoice<'a>, OptionError> {
    let idx = best_match_indices(owner, options).map_err(|e| OptionError::Evaluate {
        option: options.get(e.index()).map(|o| o.label().to_string()).unwrap_or_default(),
        source: e,
    })?;
    let choice = match idx.as_slice() {
        [one] => &options[*one],
        [] => match options.iter().find(|o| o.pass_through.is_some()) {
            Some(pt) => pt,
            None => return Err(OptionError::Match(Vec::new())),
        },
        many => return Err(OptionError::Match(many.iter().map(|i| options[*i].label().to_string()).collect())),
    };
    Ok(match (&choice.name, &choice.pass_through) {
        (Some(name), _) => OptionChoice::Template(name),
        (None, Some(input)) => OptionChoice::PassThrough(input),
        (None, None) => OptionChoice::Template(""),
    })
}
