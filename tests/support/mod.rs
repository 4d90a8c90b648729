//! Shared scaffolding for workspace integration tests.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use std::sync::Arc;
use tempfile::TempDir;

use mirrorcast::capability::{CapabilityCache, CapabilityRecord};
use mirrorcast::config::Config;
use mirrorcast::engine::double::ScriptedClient;
use mirrorcast::engine::{Supervisor, SupervisorOptions};
use mirrorcast::ledger::Ledger;
use mirrorcast::utils::types::{RunFlags, RunMode, RunRequest};

pub const MODEL: &str = "omni-medium";

/// One sandboxed world per test: log root, ledger, capability cache.
pub struct World {
    pub sandbox: TempDir,
    pub client: Arc<ScriptedClient>,
    pub supervisor: Supervisor,
    pub ledger: Arc<Ledger>,
}

impl World {
    pub fn root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.sandbox.path().to_path_buf()).unwrap()
    }

    pub fn out_root(&self) -> Utf8PathBuf {
        self.root().join("OUT")
    }

    pub fn in_root(&self) -> Utf8PathBuf {
        self.root().join("IN")
    }
}

/// Build a world whose model has the given capabilities pre-cached, so
/// the supervisor never issues probe traffic.
pub fn world_with_caps(caps: CapabilityRecord) -> World {
    let sandbox = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(sandbox.path().to_path_buf()).unwrap();

    let cache_path = root.join("capabilities.json");
    CapabilityCache::new(cache_path.clone())
        .store(MODEL, caps)
        .unwrap();

    let ledger = Arc::new(Ledger::open(&root.join("receipts.db")).unwrap());
    let client = Arc::new(ScriptedClient::new());

    let supervisor = Supervisor::new(
        Arc::clone(&client) as Arc<dyn mirrorcast::provider::ProviderClient>,
        Arc::clone(&ledger),
        Arc::new(CapabilityCache::new(cache_path)),
        None,
        SupervisorOptions {
            config: Config::minimal_for_testing(),
            log_root: root,
            force_probe: false,
        },
    );

    World {
        sandbox,
        client,
        supervisor,
        ledger,
    }
}

pub fn full_caps() -> CapabilityRecord {
    CapabilityRecord::assume_all(Utc::now())
}

pub fn caps_without_file_search() -> CapabilityRecord {
    CapabilityRecord {
        supports_file_search: false,
        ..CapabilityRecord::assume_all(Utc::now())
    }
}

pub fn request(mode: RunMode, world: &World) -> RunRequest {
    RunRequest {
        mode,
        project: Some("demo".to_string()),
        model: MODEL.to_string(),
        prompt: "make a one-file script".to_string(),
        previous_response_id: None,
        input_root: matches!(mode, RunMode::Modify).then(|| world.in_root()),
        output_root: (!matches!(mode, RunMode::Qa)).then(|| world.out_root()),
        attached_file_ids: Vec::new(),
        flags: RunFlags::default(),
    }
}

pub fn write_file(root: &Utf8Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(path.as_std_path(), content).unwrap();
}

pub fn read_file(root: &Utf8Path, rel: &str) -> String {
    std::fs::read_to_string(root.join(rel).as_std_path()).unwrap()
}

// Contract payload builders -------------------------------------------------

pub fn plan_json(tag: &str) -> String {
    format!(r#"{{"contract":"{tag}","plan":["analyze","produce files"]}}"#)
}

pub fn structure_json(paths: &[&str]) -> String {
    let files: Vec<String> = paths
        .iter()
        .map(|path| format!(r#"{{"path":"{path}"}}"#))
        .collect();
    format!(
        r#"{{"contract":"A2_STRUCTURE","files":[{}]}}"#,
        files.join(",")
    )
}

pub fn touch_plan_json(entries: &[(&str, &str)]) -> String {
    let files: Vec<String> = entries
        .iter()
        .map(|(path, action)| format!(r#"{{"path":"{path}","action":"{action}"}}"#))
        .collect();
    format!(
        r#"{{"contract":"B2_STRUCTURE","touched_files":[{}]}}"#,
        files.join(",")
    )
}

pub fn file_chunk_json(tag: &str, path: &str, content: &str, index: u32, count: u32) -> String {
    let has_more = index + 1 < count;
    let next = if has_more {
        (index + 1).to_string()
    } else {
        "null".to_string()
    };
    let content = serde_json::to_string(content).unwrap();
    format!(
        r#"{{"contract":"{tag}","path":"{path}","content":{content},"chunking":{{"max_lines":500,"chunk_index":{index},"chunk_count":{count},"has_more":{has_more},"next_chunk_index":{next}}}}}"#
    )
}
