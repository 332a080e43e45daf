use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use cmseq_design::modality::count;
use cmseq_design::plan::PLAN_SCHEMA_VERSION;
use cmseq_design::question::Question;
use cmseq_design::run::{RunSplit, N_RUNS};
use cmseq_design::seed;
use cmseq_design::structures::{synthesize, validate_structures, SynthesisConfig};
use cmseq_design::{
    bonus_payout, CanonicalStructure, Catalog, DesignParams, ExperimentPlan, Label, Modality,
    StructureTable, DEFAULT_REWARD_VALUE,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PLAN_FILE: &str = "plan.json";
pub const PLAN_DIGEST_FILE: &str = "plan.digest";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SESSION_STATE_FILE: &str = "session_state.json";
const RUNTIME_DIR: &str = "runtime";

pub const SESSION_TEMPLATE: &str = "\
experiment:
  id: ''                              # REQUIRED: study identifier
  lang: ''                            # REQUIRED: stimulus language, e.g. fr
paths:
  input_dir: ''                       # REQUIRED: holds stims/{lang}/{category}/
  output_dir: ''                      # REQUIRED: participant folders go here
design:
  structures: twelve                  # REQUIRED: six | twelve
  n_blocks: 4
  block_size: 3
  n_trials: 3
  target_repeated_pairs: 2
  reward_per_run: 3
  max_attempts: 10000
  tones: []                           # optional: one cue tone per sequence
bonus:
  reward_value: 0.5                   # payout per point on reward sequences
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub experiment: ExperimentSection,
    pub paths: PathsSection,
    pub design: DesignSection,
    #[serde(default)]
    pub bonus: BonusSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSection {
    pub id: String,
    pub lang: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignSection {
    pub structures: StructureTable,
    #[serde(flatten)]
    pub params: DesignParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusSection {
    pub reward_value: f64,
}

impl Default for BonusSection {
    fn default() -> Self {
        Self {
            reward_value: DEFAULT_REWARD_VALUE,
        }
    }
}

impl SessionConfig {
    pub fn structures(&self) -> Vec<CanonicalStructure> {
        self.design.structures.structures()
    }

    pub fn load_catalog(&self) -> Result<Catalog> {
        let catalog = Catalog::from_dir(&self.paths.input_dir, &self.experiment.lang)?;
        Ok(catalog)
    }
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let required: &[&str] = &[
        "/experiment/id",
        "/experiment/lang",
        "/paths/input_dir",
        "/paths/output_dir",
        "/design/structures",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let is_missing = match json_value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "session config missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

/// Load a YAML session file. Relative paths resolve against the file's
/// directory.
pub fn load_session_config(path: &Path) -> Result<SessionConfig> {
    let raw_yaml = fs::read_to_string(path)
        .with_context(|| format!("failed to read session config {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    validate_required_fields(&json_value)?;
    let mut config: SessionConfig = serde_json::from_value(json_value)
        .with_context(|| format!("invalid session config {}", path.display()))?;
    let base = path.parent().unwrap_or(Path::new("."));
    if config.paths.input_dir.is_relative() {
        config.paths.input_dir = base.join(&config.paths.input_dir);
    }
    if config.paths.output_dir.is_relative() {
        config.paths.output_dir = base.join(&config.paths.output_dir);
    }
    config
        .design
        .params
        .validate(config.design.structures.structures().len())?;
    if !(config.bonus.reward_value.is_finite() && config.bonus.reward_value >= 0.0) {
        return Err(anyhow!(
            "bonus.reward_value must be a non-negative number, got {}",
            config.bonus.reward_value
        ));
    }
    debug!(path = %path.display(), experiment = %config.experiment.id, "session config loaded");
    Ok(config)
}

pub fn write_session_template(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow!(
            "init file already exists (use --force): {}",
            path.display()
        ));
    }
    atomic_write_bytes(path, SESSION_TEMPLATE.as_bytes())
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn load_json_file(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&data)?)
}

fn sha256_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

// Object keys serialize sorted, so equal values hash equally.
fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

#[derive(Debug)]
struct SessionOperationLock {
    path: PathBuf,
}

impl Drop for SessionOperationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_session_lock(participant_dir: &Path) -> Result<SessionOperationLock> {
    let lock_path = participant_dir.join(RUNTIME_DIR).join("operation.lock");
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(SessionOperationLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "operation_in_progress: participant {} is locked by another process ({})",
            participant_dir.display(),
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub status: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub schema_version: String,
    pub participant: String,
    pub runs: BTreeMap<String, RunState>,
}

impl SessionState {
    pub fn run_status(&self, run: usize) -> Option<&str> {
        self.runs.get(&run.to_string()).map(|s| s.status.as_str())
    }
}

fn read_session_state(participant_dir: &Path, participant: &str) -> Result<SessionState> {
    let path = participant_dir.join(SESSION_STATE_FILE);
    if !path.exists() {
        return Ok(SessionState {
            schema_version: "session_state_v1".to_string(),
            participant: participant.to_string(),
            runs: BTreeMap::new(),
        });
    }
    let value = load_json_file(&path)?;
    Ok(serde_json::from_value(value)?)
}

fn write_run_state(
    participant_dir: &Path,
    participant: &str,
    run: usize,
    status: &str,
) -> Result<SessionState> {
    let mut state = read_session_state(participant_dir, participant)?;
    state.runs.insert(
        run.to_string(),
        RunState {
            status: status.to_string(),
            updated_at: Utc::now().to_rfc3339(),
        },
    );
    atomic_write_json_pretty(
        &participant_dir.join(SESSION_STATE_FILE),
        &serde_json::to_value(&state)?,
    )?;
    Ok(state)
}

// Marks the run "failed" unless the operation completes.
struct RunStateGuard {
    participant_dir: PathBuf,
    participant: String,
    run: usize,
    done: bool,
}

impl RunStateGuard {
    fn new(participant_dir: &Path, participant: &str, run: usize) -> Self {
        Self {
            participant_dir: participant_dir.to_path_buf(),
            participant: participant.to_string(),
            run,
            done: false,
        }
    }

    fn complete(&mut self, status: &str) -> Result<SessionState> {
        let state = write_run_state(&self.participant_dir, &self.participant, self.run, status)?;
        self.done = true;
        Ok(state)
    }
}

impl Drop for RunStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_state(&self.participant_dir, &self.participant, self.run, "failed");
        }
    }
}

fn normalize_participant(participant: &str) -> Result<(String, u64)> {
    let trimmed = participant.trim().to_string();
    let seed = seed::derive_seed(&trimmed)?;
    Ok((trimmed, seed))
}

pub fn participant_dir(config: &SessionConfig, participant: &str) -> PathBuf {
    config
        .paths
        .output_dir
        .join(format!("sub-{}", participant.trim()))
}

fn check_run_index(run: usize) -> Result<()> {
    if run == 0 || run > N_RUNS {
        return Err(anyhow!("run must be between 1 and {}, got {}", N_RUNS, run));
    }
    Ok(())
}

fn has_session_files(participant_dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(participant_dir)? {
        if entry?.file_name() != RUNTIME_DIR {
            return Ok(true);
        }
    }
    Ok(false)
}

// Caller holds the session lock, so `runtime/` survives.
fn clear_session_files(participant_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(participant_dir)? {
        let entry = entry?;
        if entry.file_name() == RUNTIME_DIR {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn persist_plan(participant_dir: &Path, participant: &str, plan: &ExperimentPlan) -> Result<String> {
    plan.validate()?;
    let value = serde_json::to_value(plan)?;
    let digest = canonical_json_digest(&value);
    atomic_write_json_pretty(&participant_dir.join(PLAN_FILE), &value)?;
    atomic_write_bytes(&participant_dir.join(PLAN_DIGEST_FILE), digest.as_bytes())?;
    let manifest = json!({
        "schema_version": "manifest_v1",
        "plan_schema": PLAN_SCHEMA_VERSION,
        "participant": participant,
        "seed": plan.seed,
        "plan_digest": digest,
        "runner_version": env!("CARGO_PKG_VERSION"),
        "created_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&participant_dir.join(MANIFEST_FILE), &manifest)?;
    Ok(digest)
}

fn load_cached_plan(participant_dir: &Path) -> Result<(ExperimentPlan, String)> {
    let value = load_json_file(&participant_dir.join(PLAN_FILE))?;
    let digest = canonical_json_digest(&value);
    let recorded = fs::read_to_string(participant_dir.join(PLAN_DIGEST_FILE))
        .with_context(|| format!("missing {} in {}", PLAN_DIGEST_FILE, participant_dir.display()))?;
    if recorded.trim() != digest {
        return Err(anyhow!(
            "plan_digest_mismatch: {} records {}, plan hashes to {}",
            PLAN_DIGEST_FILE,
            recorded.trim(),
            digest
        ));
    }
    let plan: ExperimentPlan = serde_json::from_value(value)?;
    plan.validate()?;
    Ok((plan, digest))
}

#[derive(Debug, Clone)]
pub struct SessionResult {
    pub participant: String,
    pub participant_dir: PathBuf,
    pub seed: u64,
    pub run: usize,
    pub plan_digest: String,
    pub regenerated: bool,
    pub plan: ExperimentPlan,
}

pub fn start_session(config: &SessionConfig, participant: &str, debug_mode: bool) -> Result<SessionResult> {
    let (participant, seed) = normalize_participant(participant)?;
    let dir = participant_dir(config, &participant);
    ensure_dir(&dir)?;
    let _lock = acquire_session_lock(&dir)?;
    if has_session_files(&dir)? {
        if !debug_mode {
            return Err(anyhow!(
                "participant_exists: {} is not empty; use resume, or --debug to start over",
                dir.display()
            ));
        }
        warn!(participant = %participant, dir = %dir.display(), "debug mode: clearing participant directory");
        clear_session_files(&dir)?;
    }

    seed::persist(seed, &dir)?;
    write_run_state(&dir, &participant, 1, "preparing")?;
    let mut guard = RunStateGuard::new(&dir, &participant, 1);

    let catalog = config.load_catalog()?;
    let plan = ExperimentPlan::generate(seed, &config.structures(), &catalog, &config.design.params)?;
    let plan_digest = persist_plan(&dir, &participant, &plan)?;
    guard.complete("running")?;
    info!(participant = %participant, seed, digest = %plan_digest, "session started");

    Ok(SessionResult {
        participant,
        participant_dir: dir,
        seed,
        run: 1,
        plan_digest,
        regenerated: false,
        plan,
    })
}

/// Run 2 or a crash restart of either run. The cached plan must match both
/// its digest and a fresh regeneration from the recovered seed.
pub fn resume_session(config: &SessionConfig, participant: &str, run: usize) -> Result<SessionResult> {
    check_run_index(run)?;
    let (participant, expected_seed) = normalize_participant(participant)?;
    let dir = participant_dir(config, &participant);
    let seed = seed::recover(&dir)?;
    if seed != expected_seed {
        return Err(anyhow!(
            "seed_mismatch: {} holds seed {}, participant {} derives {}",
            seed::seed_path(&dir).display(),
            seed,
            participant,
            expected_seed
        ));
    }
    let _lock = acquire_session_lock(&dir)?;
    let state = read_session_state(&dir, &participant)?;
    if state.run_status(run) == Some("completed") {
        return Err(anyhow!("run_completed: run {} of participant {} is already completed", run, participant));
    }
    if run > 1 && state.run_status(run - 1) != Some("completed") {
        warn!(participant = %participant, run, previous = ?state.run_status(run - 1), "previous run not marked completed");
    }
    write_run_state(&dir, &participant, run, "preparing")?;
    let mut guard = RunStateGuard::new(&dir, &participant, run);

    let catalog = config.load_catalog()?;
    let fresh = ExperimentPlan::generate(seed, &config.structures(), &catalog, &config.design.params)?;
    let (plan, plan_digest, regenerated) = if dir.join(PLAN_FILE).exists() {
        let (cached, digest) = load_cached_plan(&dir)?;
        if cached != fresh {
            return Err(anyhow!(
                "plan_drift: cached plan for participant {} no longer matches its seed, config or catalog",
                participant
            ));
        }
        (cached, digest, false)
    } else {
        warn!(participant = %participant, "no cached plan; regenerating from seed");
        let digest = persist_plan(&dir, &participant, &fresh)?;
        (fresh, digest, true)
    };
    guard.complete("running")?;
    info!(participant = %participant, run, seed, regenerated, "session resumed");

    Ok(SessionResult {
        participant,
        participant_dir: dir,
        seed,
        run,
        plan_digest,
        regenerated,
        plan,
    })
}

pub fn complete_run(config: &SessionConfig, participant: &str, run: usize) -> Result<SessionState> {
    check_run_index(run)?;
    let (participant, _) = normalize_participant(participant)?;
    let dir = participant_dir(config, &participant);
    seed::recover(&dir)?;
    let _lock = acquire_session_lock(&dir)?;
    match read_session_state(&dir, &participant)?.run_status(run) {
        Some("running") => {}
        Some("completed") => {
            return Err(anyhow!("run_completed: run {} of participant {} is already completed", run, participant));
        }
        status => {
            return Err(anyhow!(
                "run_not_started: run {} of participant {} is not running (status: {})",
                run,
                participant,
                status.unwrap_or("none")
            ));
        }
    }
    let state = write_run_state(&dir, &participant, run, "completed")?;
    info!(participant = %participant, run, "run completed");
    Ok(state)
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialDescription {
    pub index: usize,
    pub order: Vec<Label>,
    pub opening: Modality,
    pub stream: Vec<Modality>,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockDescription {
    pub index: usize,
    pub labels: Vec<Label>,
    pub trials: Vec<TrialDescription>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDescription {
    pub participant: String,
    pub run: usize,
    pub seed: u64,
    pub split: RunSplit,
    pub labels: Vec<Label>,
    pub repeated_pairs: Vec<String>,
    pub reward: Vec<Label>,
    pub no_reward: Vec<Label>,
    pub opening_balance: (usize, usize),
    pub question_balance: (usize, usize),
    pub tones: BTreeMap<Label, String>,
    pub blocks: Vec<BlockDescription>,
}

pub fn describe_run(config: &SessionConfig, participant: &str, run: usize) -> Result<RunDescription> {
    check_run_index(run)?;
    let (participant, _) = normalize_participant(participant)?;
    let dir = participant_dir(config, &participant);
    seed::recover(&dir)?;
    let (plan, _) = load_cached_plan(&dir)?;
    let run_plan = plan
        .run(run)
        .ok_or_else(|| anyhow!("plan has no run {}", run))?;

    let mut blocks = Vec::with_capacity(run_plan.blocks.len());
    for (b, labels) in run_plan.blocks.blocks().iter().enumerate() {
        let mut trials = Vec::new();
        for (t, order) in run_plan.trials[b].trials().iter().enumerate() {
            trials.push(TrialDescription {
                index: t + 1,
                order: order.clone(),
                opening: run_plan.modalities.opening[b][t],
                stream: run_plan.stream(b, t).unwrap_or_default(),
                questions: run_plan.questions[b][t].clone(),
            });
        }
        blocks.push(BlockDescription {
            index: b + 1,
            labels: labels.clone(),
            trials,
        });
    }
    Ok(RunDescription {
        participant,
        run,
        seed: plan.seed,
        split: plan.split,
        labels: run_plan.labels.clone(),
        repeated_pairs: run_plan
            .repeated_pairs()
            .into_iter()
            .map(|(a, b)| format!("{}{}", a, b))
            .collect(),
        reward: run_plan.rewards.reward.clone(),
        no_reward: run_plan.rewards.no_reward.clone(),
        opening_balance: count(run_plan.modalities.opening.iter().flatten()),
        question_balance: count(run_plan.modalities.questions.iter().flatten().flatten()),
        tones: plan.tones.clone(),
        blocks,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutResult {
    pub participant: String,
    pub run: usize,
    pub reward: Vec<Label>,
    pub scores: BTreeMap<Label, u32>,
    pub reward_value: f64,
    pub payout: f64,
    pub path: PathBuf,
}

pub fn compute_payout(
    config: &SessionConfig,
    participant: &str,
    run: usize,
    scores_path: &Path,
) -> Result<PayoutResult> {
    check_run_index(run)?;
    let (participant, _) = normalize_participant(participant)?;
    let dir = participant_dir(config, &participant);
    seed::recover(&dir)?;
    let (plan, _) = load_cached_plan(&dir)?;
    let run_plan = plan
        .run(run)
        .ok_or_else(|| anyhow!("plan has no run {}", run))?;
    let raw = fs::read_to_string(scores_path)
        .with_context(|| format!("failed to read scores {}", scores_path.display()))?;
    let scores: BTreeMap<Label, u32> = serde_json::from_str(&raw)
        .with_context(|| format!("scores must map sequence labels to points: {}", scores_path.display()))?;
    let payout = bonus_payout(&run_plan.rewards, &scores, config.bonus.reward_value)?;

    let path = dir.join(format!("payout_run{}.json", run));
    let _lock = acquire_session_lock(&dir)?;
    atomic_write_json_pretty(
        &path,
        &json!({
            "schema_version": "payout_v1",
            "participant": participant,
            "run": run,
            "reward": run_plan.rewards.reward,
            "scores": scores,
            "reward_value": config.bonus.reward_value,
            "payout": payout,
            "computed_at": Utc::now().to_rfc3339(),
        }),
    )?;
    info!(participant = %participant, run, payout, "bonus computed");
    Ok(PayoutResult {
        participant,
        run,
        reward: run_plan.rewards.reward.clone(),
        scores,
        reward_value: config.bonus.reward_value,
        payout,
        path,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub root: PathBuf,
    pub lang: String,
    pub categories: BTreeMap<String, usize>,
    pub pool_size: Option<usize>,
    pub structures: usize,
}

pub fn validate_catalog(config: &SessionConfig) -> Result<CatalogSummary> {
    let catalog = config.load_catalog()?;
    let structures = config.structures();
    catalog.validate(structures.len())?;
    let categories = catalog
        .category_names()
        .into_iter()
        .map(|name| {
            let n = catalog.items(name).map(|v| v.len()).unwrap_or(0);
            (name.to_string(), n)
        })
        .collect();
    Ok(CatalogSummary {
        root: config
            .paths
            .input_dir
            .join("stims")
            .join(&config.experiment.lang),
        lang: config.experiment.lang.clone(),
        categories,
        pool_size: catalog.pool_size(),
        structures: structures.len(),
    })
}

pub fn synthesize_structures(config: &SynthesisConfig, seed: u64) -> Result<Vec<CanonicalStructure>> {
    let mut rng = cmseq_design::rng::session_rng(seed);
    let table = synthesize(config, &mut rng)?;
    validate_structures(&table)?;
    Ok(table)
}
