use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide attribute word list. Non-negative wire indices resolve here;
/// the list is append-only until frozen at service construction and is passed
/// around explicitly rather than living in a true global.
#[derive(Debug, Clone)]
pub struct GlobalWords {
    words: Vec<String>,
    index: HashMap<String, i32>,
}

impl GlobalWords {
    pub fn from_words<I, S>(words: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        let index = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as i32))
            .collect();
        Arc::new(Self { words, index })
    }

    /// The words every deployment is expected to know. Proxies may advertise
    /// a shorter prefix via `global_word_count`; anything beyond that prefix
    /// travels in the per-message delta list.
    pub fn standard() -> Arc<Self> {
        Self::from_words([
            "source.ip",
            "source.port",
            "source.name",
            "source.uid",
            "source.namespace",
            "source.labels",
            "source.service",
            "source.user",
            "target.ip",
            "target.port",
            "target.name",
            "target.uid",
            "target.namespace",
            "target.labels",
            "target.service",
            "request.headers",
            "request.id",
            "request.path",
            "request.host",
            "request.method",
            "request.reason",
            "request.referer",
            "request.scheme",
            "request.size",
            "request.time",
            "request.useragent",
            "request.duration",
            "response.headers",
            "response.size",
            "response.time",
            "response.code",
            "response.duration",
            "connection.id",
            "connection.received.bytes",
            "connection.sent.bytes",
            "connection.duration",
            "context.protocol",
            "context.timestamp",
            "api.service",
            "api.version",
            "api.operation",
        ])
    }

    pub fn index_of(&self, word: &str) -> Option<i32> {
        self.index.get(word).copied()
    }

    pub fn word_at(&self, index: i32) -> Option<&str> {
        if index < 0 {
            return None;
        }
        self.words.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}
