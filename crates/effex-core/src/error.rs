//! Error types for layer planning

use thiserror::Error;

/// Result type for layer planning
pub type LayerResult<T> = Result<T, LayerError>;

/// Errors found while ordering a layer graph
///
/// Both are construction-time failures: the runtime reports them before
/// execution starts when the offending `provide` is statically visible,
/// and as a `Layer` defect otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    /// The dependency edges between layers form a cycle
    #[error("layer dependency cycle between: {}", .layers.join(", "))]
    Cycle {
        /// Names of the layers left unordered (members of or downstream of the cycle)
        layers: Vec<String>,
    },

    /// Two distinct layers export the same service
    #[error("service {service} is provided by both {first} and {second}")]
    DuplicateService {
        /// Tag name
        service: &'static str,
        /// First provider
        first: String,
        /// Second provider
        second: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = LayerError::Cycle {
            layers: vec!["A".into(), "B".into()],
        };
        assert_eq!(e.to_string(), "layer dependency cycle between: A, B");

        let e = LayerError::DuplicateService {
            service: "Db",
            first: "DbLive".into(),
            second: "DbTest".into(),
        };
        assert_eq!(e.to_string(), "service Db is provided by both DbLive and DbTest");
    }
}
