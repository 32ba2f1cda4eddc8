//! Retry and side-effect classification attached to every error.

/// Whether a poller retrying the same request may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    Permanent,
    /// Outage, shutdown or cancellation; the same cursor can be presented again.
    Retryable,
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }

    /// The wire only carries a boolean; `false` is read as permanent.
    pub fn from_wire(retryable: bool) -> Self {
        if retryable {
            Transience::Retryable
        } else {
            Transience::Permanent
        }
    }
}

/// What is known about side effects when an error is returned.
///
/// Replication reads never mutate the shard, so only a request lost in
/// transit reports `Unknown`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    None,
    Some,
    Unknown,
}

enum_str! {
    impl Effect {
        pub fn as_str(&self) -> &'static str;
        fn parse_str(raw: &str) -> Option<Self>;
        variants {
            None => ["none"],
            Some => ["some"],
            Unknown => ["unknown"],
        }
    }
}
