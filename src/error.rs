use thiserror::Error;
use tonic::Status;

/// Everything that can go wrong talking to the storage provider or the
/// local host, collapsed into one enumerated classification. No other
/// module is allowed to pattern-match on a provider error string.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("storage '{0}' not found")]
    NotFound(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("provider is currently locked, retry later")]
    Locked,

    #[error("request rejected by provider: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned malformed json: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("provider error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host command failed: {0}")]
    Mount(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Substrings the real provider API is known to use. Kept in exactly
/// one place per the design notes: nothing outside this module inspects
/// provider error text.
const ALREADY_DETACHED_MARKERS: &[&str] = &[
    "not currently attached to a server",
    "attachment not found",
];

const WRONG_FAMILY_MARKERS: &[&str] = &["invalid block storage id", "subscription id not found"];

const ALREADY_ATTACHED_MARKERS: &[&str] = &["already attached to a server"];

const LOCKED_MARKER: &str = "server is currently locked";

impl ProviderError {
    /// Classifies a raw provider API error body into a typed error.
    /// Called at the point an HTTP response is turned into a
    /// `ProviderError::Api`, and again whenever calling code needs to ask
    /// "was this actually a not-found / already-detached / locked error".
    pub fn from_api(status: u16, body: String) -> Self {
        let lower = body.to_lowercase();
        if status == 404 {
            return ProviderError::NotFound(body);
        }
        if lower.contains(LOCKED_MARKER) {
            return ProviderError::Locked;
        }
        ProviderError::Api { status, body }
    }

    /// True if this error means "the attachment you're trying to remove
    /// is already gone" — detach callers should treat it as success.
    pub fn is_already_detached(&self) -> bool {
        match self {
            ProviderError::Api { body, .. } => {
                let lower = body.to_lowercase();
                ALREADY_DETACHED_MARKERS.iter().any(|m| lower.contains(m))
            }
            ProviderError::NotFound(_) => true,
            _ => false,
        }
    }

    /// True if this error means "wrong storage family, try the next
    /// one" while probing block vs vfs handlers for an opaque volume id.
    pub fn is_wrong_family(&self) -> bool {
        match self {
            ProviderError::NotFound(_) => true,
            ProviderError::Api { body, .. } => {
                let lower = body.to_lowercase();
                WRONG_FAMILY_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, ProviderError::Locked)
    }

    /// True if an `Attach` call failed only because the volume was
    /// already attached — per design notes §9, the caller should treat
    /// this as success rather than surface it.
    pub fn is_already_attached(&self) -> bool {
        match self {
            ProviderError::Api { body, .. } => {
                let lower = body.to_lowercase();
                ALREADY_ATTACHED_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }
}

impl From<ProviderError> for Status {
    fn from(err: ProviderError) -> Status {
        match &err {
            ProviderError::NotFound(_) | ProviderError::InstanceNotFound(_) => {
                Status::not_found(err.to_string())
            }
            ProviderError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            ProviderError::Locked => Status::aborted(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}
