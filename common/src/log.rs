use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which container stream a log line was read from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of build output.
///
/// Entries are identified by their position in the per-build append order;
/// the timestamp is informational.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogItem {
    /// Unix timestamp in nanoseconds.
    pub timestamp: i64,
    pub stream: LogStream,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::{LogItem, LogStream};

    #[test]
    fn test_wire_shape() {
        let item = LogItem {
            timestamp: 1_700_000_000_000_000_000,
            stream: LogStream::Stderr,
            line: "ERROR: nothing provides foo".to_string(),
        };

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["line"], "ERROR: nothing provides foo");

        let back: LogItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }
}
