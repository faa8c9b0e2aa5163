//! sfe: server-side file encryption administration
//!
//! Commands:
//!   status                    - data directory health, switches, modules, master key
//!   enable / disable          - flip the global encryption switch
//!   module list               - registered modules, default marked
//!   module set-default <id>   - choose the module new files are encrypted with
//!   header show <path>        - print the encryption header of a stored file
//!   key-dir <module> <path>   - key directory of a file for a module
//!   put <local> <path>        - store a local file (encrypting when enabled)
//!   cat <path>                - print a stored file (decrypting)
//!   mv <old> <new>            - move a stored file and rewrap its keys
//!   restore <path>            - rewrap keys of a restored file
//!   user add <uid> / user list
//!   config show               - display current configuration
//!   decrypt-all [<user>]      - permanently decrypt one user's or every user's files

mod console;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use sfe_core::config::{SfeConfig, TomlConfigStore};
use sfe_core::services::{FilesystemView, UserManager};
use sfe_crypto::module::{DISPLAY_NAME, MODULE_ID};
use sfe_crypto::{KdfParams, XChaChaModule};
use sfe_encryption::{
    Console, DecryptAll, EncryptionModule, ModuleRegistry, PathClassifier, ProgressFn, Update,
    UpdateReport,
};
use sfe_storage::{LocalUserManager, LocalView, OwnerAccessResolver};

use console::{read_passphrase, TerminalConsole};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sfe",
    version,
    about = "Server-side file encryption",
    long_about = "sfe: manage at-rest encryption of a local file store and its encryption modules"
)]
struct Cli {
    /// Path to sfe.toml configuration file
    #[arg(long, short = 'c', env = "SFE_CONFIG", default_value = "/etc/sfe/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config file
    #[arg(long, env = "SFE_LOG")]
    log: Option<String>,

    /// Log format (json, text); defaults to the config file
    #[arg(long, env = "SFE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show data directory health, encryption state and modules
    Status,

    /// Turn server-side encryption on
    Enable,

    /// Turn server-side encryption off (existing files stay encrypted)
    Disable,

    /// Encryption module management
    Module {
        #[command(subcommand)]
        action: ModuleAction,
    },

    /// Encryption header inspection
    Header {
        #[command(subcommand)]
        action: HeaderAction,
    },

    /// Print the key directory of a file for a module
    #[command(name = "key-dir")]
    KeyDir {
        /// Module id
        module: String,
        /// Store path, e.g. /alice/files/doc.txt
        path: String,
    },

    /// Store a local file at a store path
    Put {
        /// Local file
        local: PathBuf,
        /// Store path, e.g. /alice/files/doc.txt
        path: String,
    },

    /// Write the plaintext of a stored file to stdout
    Cat {
        /// Store path
        path: String,
    },

    /// Move a stored file or folder and rewrap the keys of everything moved
    Mv {
        old: String,
        new: String,
    },

    /// Rewrap the keys of a file restored from versions or trash
    Restore {
        /// Store path, e.g. /alice/files/doc.txt
        path: String,
    },

    /// User management for the local store
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Permanently decrypt all files of one user, or of every user
    ///
    /// Encryption is switched off for the run. It is switched back on when
    /// the run aborts or when a single user was decrypted.
    #[command(name = "decrypt-all")]
    DecryptAll {
        /// Only decrypt this user's files
        user: Option<String>,
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ModuleAction {
    /// List registered encryption modules
    List,
    /// Set the default encryption module
    SetDefault { id: String },
}

#[derive(Subcommand, Debug)]
enum HeaderAction {
    /// Print the header fields of a stored file
    Show {
        path: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Create a user tree
    Add { uid: String },
    /// List users
    List {
        /// Only users whose id contains this text
        #[arg(long, default_value = "")]
        search: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);
    if !cli.config.exists() {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    let stack = Stack::build(config)?;
    match cli.command {
        Commands::Status => cmd_status(&stack),
        Commands::Enable => cmd_set_enabled(&stack, true),
        Commands::Disable => cmd_set_enabled(&stack, false),
        Commands::Module { action: ModuleAction::List } => cmd_module_list(&stack),
        Commands::Module { action: ModuleAction::SetDefault { id } } => {
            cmd_module_set_default(&stack, &id)
        }
        Commands::Header { action: HeaderAction::Show { path, json } } => {
            cmd_header_show(&stack, &path, json)
        }
        Commands::KeyDir { module, path } => cmd_key_dir(&stack, &module, &path),
        Commands::Put { local, path } => cmd_put(&stack, &local, &path),
        Commands::Cat { path } => cmd_cat(&stack, &path),
        Commands::Mv { old, new } => cmd_mv(&stack, &old, &new),
        Commands::Restore { path } => cmd_restore(&stack, &path),
        Commands::User { action: UserAction::Add { uid } } => cmd_user_add(&stack, &uid),
        Commands::User { action: UserAction::List { search } } => cmd_user_list(&stack, &search),
        Commands::DecryptAll { user, yes } => cmd_decrypt_all(&stack, user.as_deref(), yes),
        Commands::Config { action: ConfigAction::Show } => {
            cmd_config_show(&stack.config, &cli.config)
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<SfeConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(SfeConfig::default())
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output (`sfe cat`), logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// Everything a command needs, built once from the config.
struct Stack {
    config: SfeConfig,
    users: Arc<LocalUserManager>,
    classifier: Arc<PathClassifier>,
    registry: Arc<ModuleRegistry>,
    module: Arc<XChaChaModule>,
    view: Arc<LocalView>,
}

impl Stack {
    fn build(config: SfeConfig) -> Result<Self> {
        let data_dir = config.storage.data_dir.clone();
        let store_path = TomlConfigStore::default_path(&config);
        let store = TomlConfigStore::open(&store_path, &config)
            .with_context(|| format!("opening app config: {}", store_path.display()))?;

        let users = Arc::new(LocalUserManager::new(&data_dir));
        let classifier = Arc::new(PathClassifier::from_config(
            users.clone() as Arc<dyn UserManager>,
            &config.storage,
            &config.encryption,
        ));
        let module = Arc::new(XChaChaModule::new(
            &data_dir,
            classifier.clone(),
            KdfParams::from(&config.crypto),
        ));

        let registry = Arc::new(ModuleRegistry::new(Arc::new(store)));
        let instance = module.clone();
        registry
            .register_encryption_module(MODULE_ID, DISPLAY_NAME, move || {
                instance.clone() as Arc<dyn EncryptionModule>
            })
            .context("registering the default encryption module")?;

        let view = Arc::new(LocalView::new(
            &data_dir,
            registry.clone(),
            classifier.clone(),
            Arc::new(OwnerAccessResolver),
        ));

        Ok(Self {
            config,
            users,
            classifier,
            registry,
            module,
            view,
        })
    }

    fn update_for(&self, uid: &str) -> Update {
        Update::new(
            uid,
            self.view.clone() as Arc<dyn FilesystemView>,
            self.classifier.clone(),
            self.registry.clone(),
            Arc::new(OwnerAccessResolver),
        )
    }

    /// Unlock the master key, creating it on first use.
    fn unlock(&self) -> Result<()> {
        if self.module.is_unlocked() {
            return Ok(());
        }
        let passphrase = if self.module.is_initialized() {
            read_passphrase("Master key passphrase: ").context("reading passphrase")?
        } else {
            new_passphrase()?
        };
        self.module
            .unlock_or_initialize(&passphrase)
            .context("unlocking the master key")?;
        Ok(())
    }
}

fn new_passphrase() -> Result<SecretString> {
    println!("No master key yet; choose a passphrase to create one.");
    let first = read_passphrase("New master key passphrase: ").context("reading passphrase")?;
    if std::env::var(console::PASSPHRASE_ENV).is_ok() {
        return Ok(first);
    }
    let second = read_passphrase("Repeat passphrase: ").context("reading passphrase")?;
    if first.expose_secret() != second.expose_secret() {
        anyhow::bail!("passphrases do not match");
    }
    if first.expose_secret().is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }
    Ok(first)
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `sfe status` ──────────────────────────────────────────────────────────────

fn cmd_status(stack: &Stack) -> Result<()> {
    let data_dir = &stack.config.storage.data_dir;
    println!("sfe v{}", env!("CARGO_PKG_VERSION"));
    match sfe_storage::check_health(data_dir) {
        Ok(()) => println!("  data dir:    {} (ok)", data_dir.display()),
        Err(e) => println!("  data dir:    {} (unhealthy: {e:#})", data_dir.display()),
    }
    let state = if stack.registry.is_enabled() { "enabled" } else { "disabled" };
    println!("  encryption:  {state}");

    let default = stack.registry.get_default_encryption_module_id();
    let default = if default.is_empty() { "(implicit)" } else { default.as_str() };
    println!("  default:     {default}");
    println!("  modules:     {}", stack.registry.get_encryption_modules().len());

    let master = if stack.module.is_initialized() {
        format!("initialized ({})", stack.module.master_key_path().display())
    } else {
        "not initialized".to_string()
    };
    println!("  master key:  {master}");

    let users: usize = stack
        .users
        .backends()
        .iter()
        .map(|b| b.get_users("", usize::MAX, 0).len())
        .sum();
    println!("  users:       {users}");
    Ok(())
}

// ── `sfe enable` / `sfe disable` ──────────────────────────────────────────────

fn cmd_set_enabled(stack: &Stack, enabled: bool) -> Result<()> {
    stack
        .registry
        .set_enabled(enabled)
        .context("storing the encryption switch")?;
    if enabled {
        println!("Server-side encryption enabled.");
        if !stack.module.is_initialized() {
            println!("The master key is created on the first write (`sfe put`).");
        }
    } else {
        println!("Server-side encryption disabled. Existing files stay encrypted;");
        println!("run `sfe decrypt-all` to decrypt them.");
    }
    Ok(())
}

// ── `sfe module` ──────────────────────────────────────────────────────────────

fn cmd_module_list(stack: &Stack) -> Result<()> {
    let default = stack.registry.get_default_encryption_module_id();
    let modules = stack.registry.get_encryption_modules();
    let implicit = default.is_empty() && modules.len() == 1;
    for descriptor in modules {
        let marker = if descriptor.id == default || implicit { "*" } else { " " };
        println!("{marker} {:<24} {}", descriptor.id, descriptor.display_name);
    }
    Ok(())
}

fn cmd_module_set_default(stack: &Stack, id: &str) -> Result<()> {
    if !stack.registry.set_default_encryption_module(id) {
        anyhow::bail!("cannot make {id:?} the default module (not registered?)");
    }
    println!("Default encryption module: {id}");
    Ok(())
}

// ── `sfe header show` / `sfe key-dir` ─────────────────────────────────────────

fn cmd_header_show(stack: &Stack, path: &str, json: bool) -> Result<()> {
    let header = stack
        .view
        .read_header(path)
        .with_context(|| format!("reading header of {path}"))?;

    if json {
        let fields: serde_json::Map<String, serde_json::Value> = header
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(v)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&fields)?);
        return Ok(());
    }
    if header.is_empty() {
        println!("{path}: plaintext (no encryption header)");
        return Ok(());
    }
    println!("{path}:");
    for (key, value) in header.iter() {
        println!("  {key}: {value}");
    }
    Ok(())
}

fn cmd_key_dir(stack: &Stack, module: &str, path: &str) -> Result<()> {
    let dir = stack
        .classifier
        .get_file_key_dir(module, path)
        .with_context(|| format!("computing key directory of {path}"))?;
    println!("{dir}");
    Ok(())
}

// ── `sfe put` / `sfe cat` ─────────────────────────────────────────────────────

fn cmd_put(stack: &Stack, local: &Path, path: &str) -> Result<()> {
    if stack.registry.is_enabled() {
        stack.unlock()?;
    }
    let mut file =
        File::open(local).with_context(|| format!("opening {}", local.display()))?;

    let pb = make_spinner("put");
    pb.set_message(format!("{} → {path}", local.display()));
    let result = stack.view.write(path, &mut file);
    pb.finish_and_clear();
    result.with_context(|| format!("storing {path}"))?;

    let encrypted = stack
        .view
        .get_file_info(path)?
        .is_some_and(|info| info.encrypted);
    info!(path = %path, encrypted, "stored");
    println!("{path} ({})", if encrypted { "encrypted" } else { "plaintext" });
    Ok(())
}

fn cmd_cat(stack: &Stack, path: &str) -> Result<()> {
    let header = stack
        .view
        .read_header(path)
        .with_context(|| format!("reading {path}"))?;
    if !header.is_empty() {
        stack.unlock()?;
    }
    let mut stdout = io::stdout().lock();
    stack
        .view
        .read(path, &mut stdout)
        .with_context(|| format!("reading {path}"))?;
    stdout.flush()?;
    Ok(())
}

// ── `sfe mv` / `sfe restore` ──────────────────────────────────────────────────

fn cmd_mv(stack: &Stack, old: &str, new: &str) -> Result<()> {
    if stack.registry.is_enabled() {
        stack.unlock()?;
    }
    let (uid, _) = stack
        .view
        .owner_path(old)
        .with_context(|| format!("resolving owner of {old}"))?;
    stack
        .view
        .rename(old, new)
        .with_context(|| format!("moving {old} to {new}"))?;

    let report = stack
        .update_for(&uid)
        .post_rename(old, new)
        .context("updating keys after move")?;
    println!("{old} → {new}");
    print_report(&report)
}

fn cmd_restore(stack: &Stack, path: &str) -> Result<()> {
    if stack.registry.is_enabled() {
        stack.unlock()?;
    }
    let (uid, relative) = stack
        .view
        .owner_path(path)
        .with_context(|| format!("resolving owner of {path}"))?;
    let report = stack
        .update_for(&uid)
        .post_restore(&relative)
        .context("updating keys after restore")?;
    print_report(&report)
}

fn print_report(report: &UpdateReport) -> Result<()> {
    if report.updated > 0 {
        println!("keys updated for {} file(s)", report.updated);
    }
    for failure in &report.failures {
        eprintln!("  {}: {}", failure.path, failure.reason);
    }
    if !report.is_clean() {
        anyhow::bail!("key update failed for {} file(s)", report.failures.len());
    }
    Ok(())
}

// ── `sfe user` ────────────────────────────────────────────────────────────────

fn cmd_user_add(stack: &Stack, uid: &str) -> Result<()> {
    stack.users.create_user(uid)?;
    println!("created /{uid}/files");
    Ok(())
}

fn cmd_user_list(stack: &Stack, search: &str) -> Result<()> {
    for backend in stack.users.backends() {
        for uid in backend.get_users(search, usize::MAX, 0) {
            println!("{uid}");
        }
    }
    Ok(())
}

// ── `sfe config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &SfeConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `sfe decrypt-all` ─────────────────────────────────────────────────────────

fn cmd_decrypt_all(stack: &Stack, user: Option<&str>, yes: bool) -> Result<()> {
    if !stack.registry.is_enabled() {
        anyhow::bail!("server-side encryption is not enabled, nothing to decrypt");
    }
    let user = user.unwrap_or_default();
    let mut console = TerminalConsole::new(yes);

    println!();
    println!("You are about to start to decrypt all files stored in your system.");
    println!("It will depend on the encryption module and your setup if this is possible.");
    println!("Depending on the number and size of your files this can take some time.");
    println!("Please make sure that no user accesses their files during this process!");
    println!();
    if !console.confirm("Do you really want to continue?") {
        println!("aborted");
        return Ok(());
    }

    stack
        .registry
        .set_enabled(false)
        .context("switching encryption off")?;

    let pb = make_progress_bar(0, "decrypt");
    console.attach(pb.clone());
    let bar = pb.clone();
    let progress: ProgressFn = Box::new(move |user_no, total, msg| {
        bar.set_length(total);
        bar.set_position(user_no);
        bar.set_message(msg.to_string());
    });

    let mut decrypt = DecryptAll::new(
        stack.registry.clone(),
        stack.view.clone() as Arc<dyn FilesystemView>,
        stack.users.clone() as Arc<dyn UserManager>,
    )
    .with_versions(stack.config.encryption.decrypt_versions);
    let completed = decrypt.decrypt_all(&mut console, user, Some(&progress));
    if let Some(pb) = console.detach() {
        pb.finish_and_clear();
    }

    if !completed || !user.is_empty() {
        stack
            .registry
            .set_enabled(true)
            .context("switching encryption back on")?;
    }
    if !completed {
        anyhow::bail!("decrypt-all aborted, no file was touched");
    }

    let session = decrypt.session();
    println!(
        "users: {}  decrypted: {}  already plaintext: {}  shared (skipped): {}  failed: {}",
        session.users_processed,
        session.decrypted,
        session.already_plain,
        session.skipped_shared,
        session.failure_count(),
    );
    if !session.is_clean() {
        anyhow::bail!("{} file(s) could not be decrypted", session.failure_count());
    }
    Ok(())
}
