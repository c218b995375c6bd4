//! Tackle - the tool system
//!
//! "Tackle" is everything a phase can reach for: registered function tools,
//! cascades callable as tools, and the inline memory bank. The
//! quartermaster picks a subset from the manifest when a phase declares
//! `tackle: "manifest"`.

mod manifest;
mod memory;
mod quartermaster;
mod registry;

pub use manifest::{ManifestEntry, build_manifest, format_manifest};
pub use memory::{MemoryBank, register_memory_tools};
pub use quartermaster::select_tackle;
pub use registry::{Tool, ToolDescriptor, ToolRegistry, build_prompt_tool_block, to_native_schema};
