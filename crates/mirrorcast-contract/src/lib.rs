//! Response contracts and chunk assembly
//!
//! Every model response in a cascade must be a single JSON object matching
//! one of seven fixed contracts. The parser is deliberately strict: no
//! code fences, no comments, no prose. Large files arrive split into
//! chunks; the assembler stitches them back together byte-for-byte.

mod assembly;
mod parse;

pub use assembly::{AssemblyError, AssemblyProgress, ChunkAssembler};
pub use parse::{
    Chunking, Contract, ContractError, ContractKind, FileChunkContract, FilesAllContract,
    OutputFileSpec, PlanContract, StructureContract, StructureEntry, TouchAction,
    TouchPlanContract, TouchedFile, extract_first_object, parse,
};

/// Distinct reason used when the Provider reports that a
/// `previous_response_id` points at an expired server-side chain. Callers
/// can detect it and offer to restart the cascade without chaining.
pub const EXPIRED_CHAIN_REASON: &str = "expired_chain";

/// Fixed logical chunk size: content above this many lines must be split.
pub const MAX_CHUNK_LINES: u32 = 500;
