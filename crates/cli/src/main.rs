use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use loom_core::model::{from_doc, Blueprint, Owner, RunTemplate, Runnable};
use loom_core::validate::{validate_blueprint, validate_owner_name, validate_run_template, validate_runnable};
use loom_core::{obj, LoomError, ObjectKey};
use loom_realizer::{Realizer, Target};
use loom_selector::{select, Selection};
use loom_store::{MemStore, ObjectStore};
use loom_templates::{ResolvedTemplate, YttPreprocessor};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

mod docs;

use docs::Doc;

#[derive(Parser, Debug)]
#[command(name = "loomctl", version, about = "Offline checks for loom blueprints, templates and owners")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate every blueprint, template, run template, runnable and owner in the files
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show which blueprint would be selected for an owner
    Select {
        /// Owner name; optional when the files hold a single owner
        #[arg(long)]
        owner: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Stamp what can be stamped for an owner without touching a cluster
    Stamp {
        #[arg(long)]
        owner: Option<String>,
        /// Namespace for owners that do not set one
        #[arg(long = "ns", env = "LOOM_NAMESPACE", default_value = "default")]
        namespace: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("LOOM_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn check(doc: &Doc) -> Option<Result<(), LoomError>> {
    let v = &doc.value;
    if let Some(kind) = doc.blueprint_kind() {
        debug!(blueprint = doc.name(), kind = kind.as_str(), "validating");
        return Some(from_doc::<Blueprint>(v).and_then(|b| validate_blueprint(&b).map(|_| ())));
    }
    if doc.is_owner() {
        return Some(from_doc::<Owner>(v).and_then(|o| match o.owner_kind() {
            Some(k) => validate_owner_name(k, o.name()),
            None => Ok(()),
        }));
    }
    match doc.kind() {
        loom_core::model::RUNNABLE_KIND => Some(from_doc::<Runnable>(v).and_then(|r| validate_runnable(&r))),
        "ClusterRunTemplate" => Some(from_doc::<RunTemplate>(v).and_then(|r| validate_run_template(&r))),
        k if k.starts_with("Cluster") && k.ends_with("Template") => Some(ResolvedTemplate::from_doc(v).map(|_| ())),
        _ => None,
    }
}

fn validate(files: &[PathBuf], output: Output) -> Result<()> {
    let docs = docs::load(files)?;
    let mut failed = 0usize;
    let mut report = Vec::new();
    for doc in &docs {
        let Some(res) = check(doc) else {
            debug!(object = %doc.describe(), "not a loom kind; skipped");
            continue;
        };
        let error = res.err().map(|e| e.message().to_string());
        if error.is_some() {
            failed += 1;
        }
        match output {
            Output::Human => match &error {
                None => println!("ok      {}", doc.describe()),
                Some(e) => println!("invalid {} ({}): {}", doc.describe(), doc.path.display(), e),
            },
            Output::Json => report.push(json!({"object": doc.describe(), "file": doc.path, "error": error})),
        }
    }
    if output == Output::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    info!(checked = docs.len(), failed, "validation finished");
    if failed > 0 {
        anyhow::bail!("{} invalid document(s)", failed);
    }
    Ok(())
}

fn select_cmd(files: &[PathBuf], owner: Option<&str>, output: Output) -> Result<()> {
    let docs = docs::load(files)?;
    let owner = docs::find_owner(&docs, owner)?;
    let bk = from_doc::<Owner>(&owner.value)?
        .owner_kind()
        .map(|k| k.blueprint_kind())
        .context("owner kind has no blueprint kind")?;
    let candidates: Vec<Blueprint> = docs
        .iter()
        .filter(|d| d.blueprint_kind() == Some(bk))
        .filter_map(|d| match from_doc::<Blueprint>(&d.value) {
            Ok(b) => Some(b),
            Err(e) => {
                warn!(object = %d.describe(), error = %e, "unreadable blueprint");
                None
            }
        })
        .collect();
    let names: Vec<&str> = match select(&owner.value, &candidates)? {
        Selection::Found(b) => vec![b.name()],
        Selection::NotFound => Vec::new(),
        Selection::Multiple(found) => found.iter().map(|b| b.name()).collect(),
    };
    match output {
        Output::Human => match names.as_slice() {
            [] => println!("{}: no {} matches", owner.describe(), bk.as_str()),
            [one] => println!("{}: {}/{}", owner.describe(), bk.as_str(), one),
            many => println!("{}: ambiguous, {} {} match: {}", owner.describe(), many.len(), bk.as_str(), many.join(", ")),
        },
        Output::Json => {
            let selected = if names.len() == 1 { Some(names[0]) } else { None };
            println!("{}", serde_json::to_string_pretty(&json!({"owner": owner.describe(), "selected": selected, "matches": names}))?);
        }
    }
    Ok(())
}

async fn stamp(files: &[PathBuf], owner: Option<&str>, namespace: &str, output: Output) -> Result<()> {
    let docs = docs::load(files)?;
    let owner_doc = docs::find_owner(&docs, owner)?;
    let store = MemStore::new();
    for d in docs.iter().filter(|d| !d.is_owner()) {
        store.create(d.value.clone()).await.with_context(|| format!("loading {}", d.describe()))?;
    }
    let mut raw = owner_doc.value.clone();
    if obj::namespace(&raw).is_none() {
        raw["metadata"]["namespace"] = json!(namespace);
    }
    let raw = store.create(raw).await?;
    let owner: Owner = from_doc(&raw)?;
    let kind = owner.owner_kind().context("not an owner kind")?;
    let bk = kind.blueprint_kind();

    let candidates: Vec<Blueprint> = docs
        .iter()
        .filter(|d| d.blueprint_kind() == Some(bk))
        .map(|d| from_doc::<Blueprint>(&d.value))
        .collect::<Result<_, _>>()?;
    let bp = match select(&raw, &candidates)? {
        Selection::Found(b) => b,
        Selection::NotFound => anyhow::bail!("no {} selects {}", bk.as_str(), owner_doc.describe()),
        Selection::Multiple(found) => {
            let names: Vec<&str> = found.iter().map(|b| b.name()).collect();
            anyhow::bail!("{} is selected by several blueprints: {}", owner_doc.describe(), names.join(", "))
        }
    };
    let graph = validate_blueprint(bp)?;
    let ytt = YttPreprocessor::from_env();
    let realizer = Realizer { templates: &store, store: &store, ytt: &ytt };
    let realization = realizer.realize(&Target { kind, owner: &owner, doc: &raw, blueprint: bp, graph: &graph }).await;
    if let Some(e) = &realization.error {
        warn!(resource = ?e.resource(), reason = %e.reason(), "stopped early: {}", e);
    }

    let mut stamped: Vec<Value> = Vec::new();
    for r in &realization.resources {
        let Some(sr) = &r.stamped_ref else { continue };
        let key = ObjectKey::new(&sr.api_version, &sr.kind, sr.namespace.as_deref(), &sr.name);
        if let Some(mut doc) = store.get(&key).await? {
            obj::strip_managed_fields(&mut doc);
            stamped.push(doc);
        }
    }
    match output {
        Output::Human => {
            for doc in &stamped {
                print!("---\n{}", serde_yaml::to_string(doc)?);
            }
            let submitted = realization.submitted();
            eprintln!("{}: {} of {} resources stamped; {} {}", owner_doc.describe(), stamped.len(), realization.resources.len(), submitted.reason, submitted.message);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&stamped)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Validate { files } => validate(files, cli.output),
        Commands::Select { owner, files } => select_cmd(files, owner.as_deref(), cli.output),
        Commands::Stamp { owner, namespace, files } => stamp(files, owner.as_deref(), namespace, cli.output).await,
    }
}
