use serde::{Deserialize, Serialize};

/// Point-in-time view of a reporter, children nested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub fraction: f32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<Box<Progress>>,
}

impl Progress {
    /// Message of the deepest nested child, falling back to this level.
    pub fn innermost_message(&self) -> &str {
        match &self.child {
            Some(child) if !child.innermost_message().is_empty() => child.innermost_message(),
            _ => &self.message,
        }
    }
}
