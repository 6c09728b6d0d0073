use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facerec.Recognizer1",
    default_service = "org.facerec.Recognizer1",
    default_path = "/org/facerec/Recognizer1"
)]
trait Recognizer {
    async fn status(&self) -> zbus::Result<String>;
    async fn start(&self) -> zbus::Result<bool>;
    async fn stop(&self) -> zbus::Result<()>;
    async fn results(&self) -> zbus::Result<String>;
    async fn detect_image(&self, path: &str) -> zbus::Result<String>;
    async fn list_faces(&self) -> zbus::Result<String>;
    async fn add_face(
        &self,
        name: &str,
        descriptor: Vec<f64>,
        dob: &str,
        gender: &str,
    ) -> zbus::Result<u32>;
    async fn enroll_image(&self, path: &str, name: &str, dob: &str, gender: &str)
        -> zbus::Result<u32>;
    async fn delete_face(&self, index: u32) -> zbus::Result<()>;
    async fn update_face(&self, index: u32, name: &str, dob: &str, gender: &str)
        -> zbus::Result<()>;
    async fn clear_faces(&self) -> zbus::Result<()>;
    async fn export_faces(&self, pretty: bool) -> zbus::Result<String>;
    async fn import_faces(&self, json: &str, merge: bool) -> zbus::Result<u32>;
    async fn match_descriptor(&self, descriptor: Vec<f64>) -> zbus::Result<String>;
    async fn get_settings(&self) -> zbus::Result<String>;
    async fn set_settings(&self, json: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facerec", about = "Face registry and live recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show daemon status
    Status,
    /// Start live detection
    Start,
    /// Stop live detection
    Stop,
    /// Print the latest published results
    Results,
    /// Run detection once on an image file
    Detect {
        image: PathBuf,
    },
    /// List registered faces
    List,
    /// Register a face
    Add {
        name: String,
        /// Comma/space separated floats, a JSON array, or @path to a file holding either
        #[arg(short, long)]
        descriptor: String,
        /// Date of birth, YYYY-MM-DD
        #[arg(long)]
        dob: Option<String>,
        /// male, female or other
        #[arg(long)]
        gender: Option<String>,
    },
    /// Register the best-scoring face found in an image file
    Enroll {
        image: PathBuf,
        name: String,
        /// Date of birth, YYYY-MM-DD
        #[arg(long)]
        dob: Option<String>,
        /// male, female or other
        #[arg(long)]
        gender: Option<String>,
    },
    /// Remove the face at INDEX
    Remove {
        index: u32,
    },
    /// Rename the face at INDEX, keeping its descriptor
    Update {
        index: u32,
        name: String,
        #[arg(long)]
        dob: Option<String>,
        #[arg(long)]
        gender: Option<String>,
    },
    /// Remove every registered face
    Clear,
    /// Write the registry as JSON to stdout
    Export {
        #[arg(long)]
        compact: bool,
    },
    /// Load faces from a JSON export
    Import {
        file: PathBuf,
        /// Replace the registry instead of appending
        #[arg(long)]
        replace: bool,
    },
    /// Match a descriptor against the registry
    Match {
        descriptor: String,
    },
    /// Show settings, or apply a partial JSON update
    Settings {
        #[arg(long)]
        set: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = RecognizerProxy::new(&conn)
        .await
        .context("facerecd is not reachable")?;
    tracing::debug!(command = ?cli.command, "calling facerecd");

    match cli.command {
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Start => {
            if proxy.start().await? {
                println!("detection started");
            } else {
                println!("detection already running");
            }
        }
        Commands::Stop => {
            proxy.stop().await?;
            println!("detection stopped");
        }
        Commands::Results => print_faces(&proxy.results().await?)?,
        Commands::Detect { image } => {
            let path = absolute_image_path(&image)?;
            let faces = proxy.detect_image(&path).await?;
            print_faces(&format!("{{\"faces\":{faces}}}"))?;
        }
        Commands::List => {
            let faces: Vec<Value> = serde_json::from_str(&proxy.list_faces().await?)?;
            if faces.is_empty() {
                println!("No faces registered");
            }
            for face in faces {
                println!(
                    "{:>4}  {:<24} dob={} gender={} dims={}",
                    face["index"],
                    face["name"].as_str().unwrap_or_default(),
                    face["dob"].as_str().unwrap_or("-"),
                    face["gender"].as_str().unwrap_or("-"),
                    face["descriptor_len"],
                );
            }
        }
        Commands::Add {
            name,
            descriptor,
            dob,
            gender,
        } => {
            let descriptor = load_descriptor(&descriptor)?;
            let index = proxy
                .add_face(
                    &name,
                    descriptor,
                    dob.as_deref().unwrap_or_default(),
                    gender.as_deref().unwrap_or_default(),
                )
                .await?;
            println!("registered {name} at index {index}");
        }
        Commands::Enroll {
            image,
            name,
            dob,
            gender,
        } => {
            let path = absolute_image_path(&image)?;
            let index = proxy
                .enroll_image(
                    &path,
                    &name,
                    dob.as_deref().unwrap_or_default(),
                    gender.as_deref().unwrap_or_default(),
                )
                .await?;
            println!("enrolled {name} at index {index}");
        }
        Commands::Remove { index } => {
            proxy.delete_face(index).await?;
            println!("removed index {index}");
        }
        Commands::Update {
            index,
            name,
            dob,
            gender,
        } => {
            proxy
                .update_face(
                    index,
                    &name,
                    dob.as_deref().unwrap_or_default(),
                    gender.as_deref().unwrap_or_default(),
                )
                .await?;
            println!("updated index {index}");
        }
        Commands::Clear => {
            proxy.clear_faces().await?;
            println!("registry cleared");
        }
        Commands::Export { compact } => println!("{}", proxy.export_faces(!compact).await?),
        Commands::Import { file, replace } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let accepted = proxy.import_faces(&json, !replace).await?;
            println!("imported {accepted} face(s)");
        }
        Commands::Match { descriptor } => {
            let descriptor = load_descriptor(&descriptor)?;
            let result: Value = serde_json::from_str(&proxy.match_descriptor(descriptor).await?)?;
            println!(
                "{} (distance {})",
                result["name"].as_str().unwrap_or("unknown"),
                format_distance(&result["distance"])
            );
        }
        Commands::Settings { set } => {
            let json = match set {
                Some(update) => proxy.set_settings(&update).await?,
                None => proxy.get_settings().await?,
            };
            print_json(&json)?;
        }
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_faces(raw: &str) -> Result<()> {
    let snapshot: Value = serde_json::from_str(raw)?;
    let faces = snapshot["faces"].as_array().cloned().unwrap_or_default();
    if faces.is_empty() {
        println!("No faces");
        return Ok(());
    }
    for face in faces {
        let bbox = &face["box"];
        let mut line = format!(
            "{:<16} score={:.2} box=({},{} {}x{})",
            face["name"].as_str().unwrap_or("unknown"),
            face["score"].as_f64().unwrap_or_default(),
            bbox["x"],
            bbox["y"],
            bbox["width"],
            bbox["height"],
        );
        if let Some(age) = face["age"].as_f64() {
            line.push_str(&format!(" age={age:.0}"));
        }
        if let Some(gender) = face["gender"].as_str() {
            line.push_str(&format!(" gender={gender}"));
        }
        if let Some(top) = dominant(&face["expressions"]) {
            line.push_str(&format!(" expression={top}"));
        }
        println!("{line}");
    }
    Ok(())
}

fn dominant(expressions: &Value) -> Option<String> {
    expressions
        .as_object()?
        .iter()
        .filter_map(|(k, v)| v.as_f64().map(|score| (k, score)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(k, _)| k.clone())
}

fn format_distance(distance: &Value) -> String {
    match distance.as_f64() {
        Some(d) => format!("{d:.4}"),
        None => "inf".to_string(),
    }
}

/// The daemon resolves paths from its own working directory.
fn absolute_image_path(image: &Path) -> Result<String> {
    let path = std::fs::canonicalize(image)
        .with_context(|| format!("reading {}", image.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

/// Resolve `@path` indirection, then parse.
fn load_descriptor(arg: &str) -> Result<Vec<f64>> {
    match arg.strip_prefix('@') {
        Some(path) => {
            let text =
                std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            parse_descriptor(&text)
        }
        None => parse_descriptor(arg),
    }
}

fn parse_descriptor(text: &str) -> Result<Vec<f64>> {
    let text = text.trim();
    let values: Vec<f64> = if text.starts_with('[') {
        serde_json::from_str(text).context("descriptor is not a JSON array of numbers")?
    } else {
        text.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<f64>().with_context(|| format!("not a number: {s:?}")))
            .collect::<Result<_>>()?
    };
    if values.is_empty() {
        bail!("descriptor is empty");
    }
    Ok(values)
}
