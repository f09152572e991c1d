//! Event trait - binds an event-type string to a payload type.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct IncidentCreated {
///     id: i64,
///     address: Option<String>,
/// }
///
/// impl Event for IncidentCreated {
///     const TYPE: &'static str = "incident.created";
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
