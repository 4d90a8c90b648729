//! Strict contract parsing
//!
//! A response is accepted only if it is (or contains exactly one balanced)
//! top-level JSON object whose `contract` field names the expected
//! contract. Field checks are explicit rather than derive-driven so every
//! failure carries a JSON-pointer-style location.

use mirrorcast_pathsafe::validate_rel_path;
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

use crate::MAX_CHUNK_LINES;

/// The seven response contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    A1Plan,
    A2Structure,
    A3File,
    B1Plan,
    B2Structure,
    B3File,
    CFilesAll,
}

impl ContractKind {
    /// Wire-level contract tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A1Plan => "A1_PLAN",
            Self::A2Structure => "A2_STRUCTURE",
            Self::A3File => "A3_FILE",
            Self::B1Plan => "B1_PLAN",
            Self::B2Structure => "B2_STRUCTURE",
            Self::B3File => "B3_FILE",
            Self::CFilesAll => "C_FILES_ALL",
        }
    }
}

impl std::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response that did not match its expected contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("contract {contract} invalid at {pointer}: {reason}")]
pub struct ContractError {
    pub contract: String,
    /// JSON-pointer-style location of the offending field.
    pub pointer: String,
    pub reason: String,
}

impl ContractError {
    fn new(contract: ContractKind, pointer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            contract: contract.as_str().to_string(),
            pointer: pointer.into(),
            reason: reason.into(),
        }
    }
}

/// An ordered plan of work (`A1_PLAN` / `B1_PLAN`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanContract {
    pub plan: Vec<String>,
    pub notes: Option<String>,
}

/// One planned output file in `A2_STRUCTURE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureEntry {
    pub path: String,
    pub purpose: Option<String>,
}

/// The full planned file layout (`A2_STRUCTURE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureContract {
    pub files: Vec<StructureEntry>,
}

/// Action on one touched file in `B2_STRUCTURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Create,
    Modify,
    Delete,
}

impl TouchAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One entry of `B2_STRUCTURE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchedFile {
    pub path: String,
    pub action: TouchAction,
    pub reason: Option<String>,
}

/// The touched-file list (`B2_STRUCTURE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchPlanContract {
    pub touched_files: Vec<TouchedFile>,
}

/// Chunking metadata carried by `A3_FILE` / `B3_FILE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunking {
    pub max_lines: u32,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub has_more: bool,
    pub next_chunk_index: Option<u32>,
}

/// One chunk of one file (`A3_FILE` / `B3_FILE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunkContract {
    pub path: String,
    pub content: String,
    pub chunking: Chunking,
}

/// One complete output file in `C_FILES_ALL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFileSpec {
    pub path: String,
    pub content: String,
}

/// The whole-project batch payload (`C_FILES_ALL`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesAllContract {
    pub files: Vec<OutputFileSpec>,
}

/// A parsed, validated contract instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contract {
    Plan(PlanContract),
    Structure(StructureContract),
    TouchPlan(TouchPlanContract),
    FileChunk(FileChunkContract),
    FilesAll(FilesAllContract),
}

/// Extract the first balanced top-level JSON object from raw text.
///
/// String literals and escapes are honored; nothing outside the first
/// balanced object is considered. Returns `None` when no balanced object
/// exists.
#[must_use]
pub fn extract_first_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse raw model output against an expected contract.
///
/// # Errors
///
/// Returns a [`ContractError`] naming the contract, the offending
/// location, and the reason, for any deviation from the schema.
pub fn parse(expected: ContractKind, raw: &str) -> Result<Contract, ContractError> {
    let object = decode_object(expected, raw)?;

    let tag = require_str(expected, &object, "contract")?;
    if tag != expected.as_str() {
        return Err(ContractError::new(
            expected,
            "/contract",
            format!("expected {expected}, found {tag}"),
        ));
    }

    match expected {
        ContractKind::A1Plan | ContractKind::B1Plan => parse_plan(expected, &object),
        ContractKind::A2Structure => parse_structure(expected, &object),
        ContractKind::B2Structure => parse_touch_plan(expected, &object),
        ContractKind::A3File | ContractKind::B3File => parse_file_chunk(expected, &object),
        ContractKind::CFilesAll => parse_files_all(expected, &object),
    }
}

fn decode_object(expected: ContractKind, raw: &str) -> Result<Map<String, Value>, ContractError> {
    let trimmed = raw.trim();

    // Pure JSON first; only then fall back to balanced-object extraction.
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => {
            let candidate = extract_first_object(trimmed).ok_or_else(|| {
                ContractError::new(expected, "/", "no balanced JSON object in response")
            })?;
            serde_json::from_str(candidate).map_err(|e| {
                ContractError::new(expected, "/", format!("extracted object is not valid JSON: {e}"))
            })?
        }
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ContractError::new(
            expected,
            "/",
            format!("top level must be an object, found {}", type_name(&other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn require_str<'a>(
    expected: ContractKind,
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, ContractError> {
    object
        .get(field)
        .ok_or_else(|| ContractError::new(expected, format!("/{field}"), "missing required field"))?
        .as_str()
        .ok_or_else(|| ContractError::new(expected, format!("/{field}"), "must be a string"))
}

fn require_array<'a>(
    expected: ContractKind,
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a Vec<Value>, ContractError> {
    object
        .get(field)
        .ok_or_else(|| ContractError::new(expected, format!("/{field}"), "missing required field"))?
        .as_array()
        .ok_or_else(|| ContractError::new(expected, format!("/{field}"), "must be an array"))
}

fn optional_str(
    expected: ContractKind,
    object: &Map<String, Value>,
    field: &str,
) -> Result<Option<String>, ContractError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ContractError::new(
            expected,
            format!("/{field}"),
            "must be a string when present",
        )),
    }
}

fn entry_object<'a>(
    expected: ContractKind,
    value: &'a Value,
    pointer: &str,
) -> Result<&'a Map<String, Value>, ContractError> {
    value
        .as_object()
        .ok_or_else(|| ContractError::new(expected, pointer, "must be an object"))
}

fn entry_str<'a>(
    expected: ContractKind,
    entry: &'a Map<String, Value>,
    pointer: &str,
    field: &str,
) -> Result<&'a str, ContractError> {
    entry
        .get(field)
        .ok_or_else(|| {
            ContractError::new(expected, format!("{pointer}/{field}"), "missing required field")
        })?
        .as_str()
        .ok_or_else(|| ContractError::new(expected, format!("{pointer}/{field}"), "must be a string"))
}

fn checked_path(
    expected: ContractKind,
    seen: &mut HashSet<String>,
    path: &str,
    pointer: &str,
) -> Result<(), ContractError> {
    validate_rel_path(path)
        .map_err(|e| ContractError::new(expected, pointer, e.to_string()))?;
    if !seen.insert(path.to_string()) {
        return Err(ContractError::new(
            expected,
            pointer,
            format!("duplicate path: {path}"),
        ));
    }
    Ok(())
}

fn parse_plan(
    expected: ContractKind,
    object: &Map<String, Value>,
) -> Result<Contract, ContractError> {
    let raw_plan = require_array(expected, object, "plan")?;
    if raw_plan.is_empty() {
        return Err(ContractError::new(expected, "/plan", "must not be empty"));
    }
    let mut plan = Vec::with_capacity(raw_plan.len());
    for (index, item) in raw_plan.iter().enumerate() {
        let step = item.as_str().ok_or_else(|| {
            ContractError::new(expected, format!("/plan/{index}"), "must be a string")
        })?;
        plan.push(step.to_string());
    }
    let notes = optional_str(expected, object, "notes")?;
    Ok(Contract::Plan(PlanContract { plan, notes }))
}

fn parse_structure(
    expected: ContractKind,
    object: &Map<String, Value>,
) -> Result<Contract, ContractError> {
    let raw_files = require_array(expected, object, "files")?;
    if raw_files.is_empty() {
        return Err(ContractError::new(expected, "/files", "must not be empty"));
    }
    let mut seen = HashSet::new();
    let mut files = Vec::with_capacity(raw_files.len());
    for (index, item) in raw_files.iter().enumerate() {
        let pointer = format!("/files/{index}");
        let entry = entry_object(expected, item, &pointer)?;
        let path = entry_str(expected, entry, &pointer, "path")?;
        checked_path(expected, &mut seen, path, &format!("{pointer}/path"))?;
        let purpose = optional_str(expected, entry, "purpose")?;
        files.push(StructureEntry {
            path: path.to_string(),
            purpose,
        });
    }
    Ok(Contract::Structure(StructureContract { files }))
}

fn parse_touch_plan(
    expected: ContractKind,
    object: &Map<String, Value>,
) -> Result<Contract, ContractError> {
    let raw = require_array(expected, object, "touched_files")?;
    if raw.is_empty() {
        return Err(ContractError::new(
            expected,
            "/touched_files",
            "must not be empty",
        ));
    }
    let mut seen = HashSet::new();
    let mut touched_files = Vec::with_capacity(raw.len());
    for (index, item) in raw.iter().enumerate() {
        let pointer = format!("/touched_files/{index}");
        let entry = entry_object(expected, item, &pointer)?;
        let path = entry_str(expected, entry, &pointer, "path")?;
        checked_path(expected, &mut seen, path, &format!("{pointer}/path"))?;
        let action_str = entry_str(expected, entry, &pointer, "action")?;
        let action = TouchAction::parse(action_str).ok_or_else(|| {
            ContractError::new(
                expected,
                format!("{pointer}/action"),
                format!("unknown action '{action_str}', expected create|modify|delete"),
            )
        })?;
        let reason = optional_str(expected, entry, "reason")?;
        touched_files.push(TouchedFile {
            path: path.to_string(),
            action,
            reason,
        });
    }
    Ok(Contract::TouchPlan(TouchPlanContract { touched_files }))
}

fn entry_u32(
    expected: ContractKind,
    entry: &Map<String, Value>,
    pointer: &str,
    field: &str,
) -> Result<u32, ContractError> {
    entry
        .get(field)
        .ok_or_else(|| {
            ContractError::new(expected, format!("{pointer}/{field}"), "missing required field")
        })?
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            ContractError::new(
                expected,
                format!("{pointer}/{field}"),
                "must be an unsigned integer",
            )
        })
}

fn parse_file_chunk(
    expected: ContractKind,
    object: &Map<String, Value>,
) -> Result<Contract, ContractError> {
    let path = require_str(expected, object, "path")?;
    validate_rel_path(path)
        .map_err(|e| ContractError::new(expected, "/path", e.to_string()))?;
    let content = require_str(expected, object, "content")?.to_string();

    let chunking_value = object.get("chunking").ok_or_else(|| {
        ContractError::new(expected, "/chunking", "missing required field")
    })?;
    let chunking_map = entry_object(expected, chunking_value, "/chunking")?;

    let max_lines = entry_u32(expected, chunking_map, "/chunking", "max_lines")?;
    if max_lines != MAX_CHUNK_LINES {
        return Err(ContractError::new(
            expected,
            "/chunking/max_lines",
            format!("must be {MAX_CHUNK_LINES}"),
        ));
    }
    let chunk_index = entry_u32(expected, chunking_map, "/chunking", "chunk_index")?;
    let chunk_count = entry_u32(expected, chunking_map, "/chunking", "chunk_count")?;
    let has_more = chunking_map
        .get("has_more")
        .ok_or_else(|| {
            ContractError::new(expected, "/chunking/has_more", "missing required field")
        })?
        .as_bool()
        .ok_or_else(|| {
            ContractError::new(expected, "/chunking/has_more", "must be a boolean")
        })?;
    let next_chunk_index = match chunking_map.get("next_chunk_index") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_u64().and_then(|v| u32::try_from(v).ok()).ok_or_else(
            || {
                ContractError::new(
                    expected,
                    "/chunking/next_chunk_index",
                    "must be an unsigned integer when present",
                )
            },
        )?),
    };

    if chunk_count == 0 {
        return Err(ContractError::new(
            expected,
            "/chunking/chunk_count",
            "must be at least 1",
        ));
    }
    if chunk_index >= chunk_count {
        return Err(ContractError::new(
            expected,
            "/chunking/chunk_index",
            format!("must be below chunk_count ({chunk_count})"),
        ));
    }
    if has_more != (chunk_index + 1 < chunk_count) {
        return Err(ContractError::new(
            expected,
            "/chunking/has_more",
            "inconsistent with chunk_index and chunk_count",
        ));
    }

    Ok(Contract::FileChunk(FileChunkContract {
        path: path.to_string(),
        content,
        chunking: Chunking {
            max_lines,
            chunk_index,
            chunk_count,
            has_more,
            next_chunk_index,
        },
    }))
}

fn parse_files_all(
    expected: ContractKind,
    object: &Map<String, Value>,
) -> Result<Contract, ContractError> {
    let raw_files = require_array(expected, object, "files")?;
    if raw_files.is_empty() {
        return Err(ContractError::new(expected, "/files", "must not be empty"));
    }
    let mut seen = HashSet::new();
    let mut files = Vec::with_capacity(raw_files.len());
    for (index, item) in raw_files.iter().enumerate() {
        let pointer = format!("/files/{index}");
        let entry = entry_object(expected, item, &pointer)?;
        let path = entry_str(expected, entry, &pointer, "path")?;
        checked_path(expected, &mut seen, path, &format!("{pointer}/path"))?;
        let content = entry_str(expected, entry, &pointer, "content")?;
        files.push(OutputFileSpec {
            path: path.to_string(),
            content: content.to_string(),
        });
    }
    Ok(Contract::FilesAll(FilesAllContract { files }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_happy_path() {
        let raw = r#"{"contract":"A1_PLAN","plan":["analyze","emit"],"notes":"short"}"#;
        match parse(ContractKind::A1Plan, raw).unwrap() {
            Contract::Plan(plan) => {
                assert_eq!(plan.plan, vec!["analyze", "emit"]);
                assert_eq!(plan.notes.as_deref(), Some("short"));
            }
            other => panic!("expected plan, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_contract_field_is_rejected() {
        let raw = r#"{"path":"ok.py","content":"x"}"#;
        let err = parse(ContractKind::A3File, raw).unwrap_err();
        assert_eq!(err.pointer, "/contract");
        assert_eq!(err.contract, "A3_FILE");
    }

    #[test]
    fn test_wrong_contract_tag_is_rejected() {
        let raw = r#"{"contract":"A1_PLAN","plan":["x"]}"#;
        let err = parse(ContractKind::B1Plan, raw).unwrap_err();
        assert!(err.reason.contains("expected B1_PLAN"));
    }

    #[test]
    fn test_extraction_of_embedded_object() {
        let raw = "Sure, here you go:\n{\"contract\":\"A1_PLAN\",\"plan\":[\"only step\"]}\nHope that helps!";
        match parse(ContractKind::A1Plan, raw).unwrap() {
            Contract::Plan(plan) => assert_eq!(plan.plan, vec!["only step"]),
            other => panic!("expected plan, got {other:?}"),
        }
    }

    #[test]
    fn test_extraction_honors_braces_inside_strings() {
        let raw = r#"noise {"contract":"A1_PLAN","plan":["use {braces} safely"]} trailing"#;
        match parse(ContractKind::A1Plan, raw).unwrap() {
            Contract::Plan(plan) => assert_eq!(plan.plan, vec!["use {braces} safely"]),
            other => panic!("expected plan, got {other:?}"),
        }
    }

    #[test]
    fn test_top_level_array_is_rejected() {
        let raw = r#"[{"contract":"A1_PLAN","plan":["x"]}]"#;
        // Extraction finds the inner object, which is fine: only the first
        // balanced object is considered.
        assert!(parse(ContractKind::A1Plan, raw).is_ok());

        let raw = r#""just a string""#;
        let err = parse(ContractKind::A1Plan, raw).unwrap_err();
        assert_eq!(err.pointer, "/");
    }

    #[test]
    fn test_structure_rejects_traversal_paths() {
        let raw = r#"{"contract":"A2_STRUCTURE","files":[{"path":"../evil.py"}]}"#;
        let err = parse(ContractKind::A2Structure, raw).unwrap_err();
        assert_eq!(err.pointer, "/files/0/path");
    }

    #[test]
    fn test_structure_rejects_backslash_paths() {
        let raw = r#"{"contract":"A2_STRUCTURE","files":[{"path":"src\\main.py"}]}"#;
        let err = parse(ContractKind::A2Structure, raw).unwrap_err();
        assert!(err.reason.contains("backslash"));
    }

    #[test]
    fn test_structure_rejects_duplicate_paths() {
        let raw =
            r#"{"contract":"A2_STRUCTURE","files":[{"path":"main.py"},{"path":"main.py"}]}"#;
        let err = parse(ContractKind::A2Structure, raw).unwrap_err();
        assert_eq!(err.pointer, "/files/1/path");
        assert!(err.reason.contains("duplicate"));
    }

    #[test]
    fn test_touch_plan_actions() {
        let raw = r#"{"contract":"B2_STRUCTURE","touched_files":[
            {"path":"a.txt","action":"modify"},
            {"path":"b.txt","action":"delete","reason":"obsolete"}
        ]}"#;
        match parse(ContractKind::B2Structure, raw).unwrap() {
            Contract::TouchPlan(tp) => {
                assert_eq!(tp.touched_files.len(), 2);
                assert_eq!(tp.touched_files[0].action, TouchAction::Modify);
                assert_eq!(tp.touched_files[1].action, TouchAction::Delete);
            }
            other => panic!("expected touch plan, got {other:?}"),
        }
    }

    #[test]
    fn test_touch_plan_rejects_unknown_action() {
        let raw = r#"{"contract":"B2_STRUCTURE","touched_files":[{"path":"a","action":"rewrite"}]}"#;
        let err = parse(ContractKind::B2Structure, raw).unwrap_err();
        assert_eq!(err.pointer, "/touched_files/0/action");
    }

    fn chunk_json(index: u32, count: u32) -> String {
        let has_more = index + 1 < count;
        format!(
            r#"{{"contract":"A3_FILE","path":"main.py","content":"x","chunking":{{"max_lines":500,"chunk_index":{index},"chunk_count":{count},"has_more":{has_more},"next_chunk_index":{next}}}}}"#,
            next = if has_more {
                (index + 1).to_string()
            } else {
                "null".to_string()
            }
        )
    }

    #[test]
    fn test_file_chunk_happy_path() {
        match parse(ContractKind::A3File, &chunk_json(0, 2)).unwrap() {
            Contract::FileChunk(chunk) => {
                assert_eq!(chunk.path, "main.py");
                assert!(chunk.chunking.has_more);
                assert_eq!(chunk.chunking.next_chunk_index, Some(1));
            }
            other => panic!("expected file chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_file_chunk_rejects_inconsistent_has_more() {
        let raw = r#"{"contract":"A3_FILE","path":"m.py","content":"x","chunking":
            {"max_lines":500,"chunk_index":0,"chunk_count":2,"has_more":false}}"#;
        let err = parse(ContractKind::A3File, raw).unwrap_err();
        assert_eq!(err.pointer, "/chunking/has_more");
    }

    #[test]
    fn test_file_chunk_rejects_index_out_of_range() {
        let raw = r#"{"contract":"A3_FILE","path":"m.py","content":"x","chunking":
            {"max_lines":500,"chunk_index":2,"chunk_count":2,"has_more":false}}"#;
        let err = parse(ContractKind::A3File, raw).unwrap_err();
        assert_eq!(err.pointer, "/chunking/chunk_index");
    }

    #[test]
    fn test_file_chunk_rejects_zero_chunk_count() {
        let raw = r#"{"contract":"A3_FILE","path":"m.py","content":"x","chunking":
            {"max_lines":500,"chunk_index":0,"chunk_count":0,"has_more":false}}"#;
        let err = parse(ContractKind::A3File, raw).unwrap_err();
        assert_eq!(err.pointer, "/chunking/chunk_count");
    }

    #[test]
    fn test_file_chunk_rejects_wrong_max_lines() {
        let raw = r#"{"contract":"A3_FILE","path":"m.py","content":"x","chunking":
            {"max_lines":400,"chunk_index":0,"chunk_count":1,"has_more":false}}"#;
        let err = parse(ContractKind::A3File, raw).unwrap_err();
        assert_eq!(err.pointer, "/chunking/max_lines");
    }

    #[test]
    fn test_files_all_happy_path() {
        let raw = r#"{"contract":"C_FILES_ALL","files":[
            {"path":"r/x","content":"1"},{"path":"r/y","content":"2"}
        ]}"#;
        match parse(ContractKind::CFilesAll, raw).unwrap() {
            Contract::FilesAll(all) => {
                assert_eq!(all.files.len(), 2);
                assert_eq!(all.files[0].path, "r/x");
                assert_eq!(all.files[1].content, "2");
            }
            other => panic!("expected files-all, got {other:?}"),
        }
    }

    #[test]
    fn test_files_all_rejects_duplicates() {
        let raw = r#"{"contract":"C_FILES_ALL","files":[
            {"path":"r/x","content":"1"},{"path":"r/x","content":"2"}
        ]}"#;
        assert!(parse(ContractKind::CFilesAll, raw).is_err());
    }

    #[test]
    fn test_round_trip_of_valid_instance() {
        // parse(serialize(x)) == x for a representative instance
        let original = chunk_json(1, 3);
        let parsed = parse(ContractKind::A3File, &original).unwrap();
        let Contract::FileChunk(chunk) = &parsed else {
            panic!("expected file chunk");
        };
        let reserialized = format!(
            r#"{{"contract":"A3_FILE","path":"{}","content":"{}","chunking":{{"max_lines":{},"chunk_index":{},"chunk_count":{},"has_more":{},"next_chunk_index":{}}}}}"#,
            chunk.path,
            chunk.content,
            chunk.chunking.max_lines,
            chunk.chunking.chunk_index,
            chunk.chunking.chunk_count,
            chunk.chunking.has_more,
            chunk
                .chunking
                .next_chunk_index
                .map_or("null".to_string(), |v| v.to_string()),
        );
        assert_eq!(parse(ContractKind::A3File, &reserialized).unwrap(), parsed);
    }

    #[test]
    fn test_no_code_fence_tolerance() {
        // A fenced block is only accepted because extraction finds the
        // balanced object inside; a fence with no object still fails.
        let raw = "```json\nnot json\n```";
        assert!(parse(ContractKind::A1Plan, raw).is_err());
    }
}
