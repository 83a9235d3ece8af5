//! Data model and RPC envelope shared by every Sandstorm core process:
//! the grain supervisor, the in-grain HTTP bridge, the backend, and the
//! gateway. Keeping these types in one crate is what lets the four
//! processes agree on identifiers and wire shapes without a shared schema
//! compiler (spec.md §9 assumes one exists; this workspace does not have
//! one available, so the types below are the single source of truth
//! instead).

pub mod appid_replacements;
pub mod http_table;
pub mod ids;
pub mod manifest;
pub mod rpc;
pub mod spk;

pub use appid_replacements::{apply_appid_replacements, AppIdReplacement, ReplacementError};
pub use ids::{AppId, GrainId, PackageId};
pub use manifest::{Command, Manifest, ManifestError};
pub use rpc::{CapRedirector, Membrane, RpcClient, RpcError, RpcRequest, RpcResponse, RpcTarget};
