use std::fmt;

/// One of the two external payment processors. `Default` is preferred
/// (cheaper); `Fallback` is only tried once `Default` is failing or refuses
/// the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorType {
    Default,
    Fallback,
}

impl ProcessorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorType::Default => "default",
            ProcessorType::Fallback => "fallback",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "default" => Some(ProcessorType::Default),
            "fallback" => Some(ProcessorType::Fallback),
            _ => None,
        }
    }

    pub const ALL: [ProcessorType; 2] = [ProcessorType::Default, ProcessorType::Fallback];
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
