//! Schematic identity resolution.
//!
//! A machine's schematic describes the composition of its installation
//! image. Nodes built from an explicit schematic carry a synthetic extension
//! whose description marks it as the schematic id publisher and whose
//! version is the id itself. Nodes without extensions run the vanilla image;
//! nodes with extensions but no marker cannot be attributed to a schematic.

use serde::{Deserialize, Serialize};

/// Description carried by the synthetic extension publishing the schematic
/// id.
pub const SCHEMATIC_ID_EXTENSION_DESCRIPTION: &str = "schematic id extension";

/// Canonical id of the empty (vanilla) schematic.
pub const DEFAULT_SCHEMATIC_ID: &str =
    "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

/// Resolved schematic identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schematic {
    pub id: String,
    /// Set when extensions are present that no schematic accounts for.
    pub invalid: bool,
}

/// One extension status entry reported by a node.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionEntry<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub description: &'a str,
}

/// Resolve the schematic identity from a node's extension statuses.
pub fn resolve<'a>(entries: impl IntoIterator<Item = ExtensionEntry<'a>>) -> Schematic {
    let mut unaccounted = 0usize;

    for entry in entries {
        if entry.description == SCHEMATIC_ID_EXTENSION_DESCRIPTION {
            return Schematic {
                id: entry.version.to_string(),
                invalid: false,
            };
        }

        tracing::debug!(extension = entry.name, "extension without schematic marker");
        unaccounted += 1;
    }

    if unaccounted > 0 {
        return Schematic {
            id: String::new(),
            invalid: true,
        };
    }

    Schematic {
        id: DEFAULT_SCHEMATIC_ID.to_string(),
        invalid: false,
    }
}
