//! Capability negotiation (OPTIONS)

use serde::Serialize;

use super::checksum::ChecksumAlgorithm;
use super::types::{TUS_EXTENSIONS, TUS_VERSION};

/// What the server advertises to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub version: &'static str,
    pub extensions: Vec<&'static str>,
    pub checksum_algorithms: Vec<String>,
    pub max_size: Option<u64>,
}

impl Capabilities {
    /// Value of the `Tus-Extension` header
    pub fn extension_header(&self) -> String {
        self.extensions.join(",")
    }

    /// Value of the `Tus-Checksum-Algorithm` header
    pub fn checksum_algorithm_header(&self) -> String {
        self.checksum_algorithms.join(",")
    }
}

/// Describe the server's capabilities for a given size ceiling (0 = none)
pub fn describe_capabilities(max_size: u64) -> Capabilities {
    let names: Vec<&str> = ChecksumAlgorithm::ALL.iter().map(|a| a.name()).collect();

    Capabilities {
        version: TUS_VERSION,
        extensions: TUS_EXTENSIONS.to_vec(),
        checksum_algorithms: escape_algorithm_names(&names),
        max_size: (max_size > 0).then_some(max_size),
    }
}

/// Quote names that contain a comma so the joined list stays parseable
pub fn escape_algorithm_names(names: &[&str]) -> Vec<String> {
    names
        .iter()
        .map(|name| {
            if name.contains(',') {
                format!("\"{}\"", name)
            } else {
                name.to_string()
            }
        })
        .collect()
}
