// CLI commands for operating the Green Code engine
use anyhow::{bail, Context, Result};
use greencode_common::endpoints;
use greencode_common::types::{Language, SubmissionRequest};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use uuid::Uuid;

/// The subset of a registry entry the CLI cares about
#[derive(Debug, Clone, Deserialize)]
pub struct LanguageEntry {
    pub name: Language,
    pub image: String,
    #[serde(default)]
    pub dockerfile_dir: Option<PathBuf>,
    pub file_extension: String,
}

#[derive(Debug, Deserialize)]
pub struct LanguagesJson {
    pub languages: Vec<LanguageEntry>,
}

/// Load languages configuration
fn load_languages_config(config_path: &Path) -> Result<LanguagesJson> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", config_path.display()))
}

fn find_language(config: &LanguagesJson, name: Language) -> Result<&LanguageEntry> {
    config
        .languages
        .iter()
        .find(|l| l.name == name)
        .ok_or_else(|| anyhow::anyhow!("Language '{}' not found in config", name))
}

pub fn list_languages(config_path: &Path) -> Result<()> {
    let config = load_languages_config(config_path)?;
    if config.languages.is_empty() {
        println!("No languages configured in {}", config_path.display());
        return Ok(());
    }

    println!("{:<10} {:<6} {:<24} DOCKERFILE", "LANGUAGE", "EXT", "IMAGE");
    for lang in &config.languages {
        let dockerfile = lang
            .dockerfile_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<6} {:<24} {}",
            lang.name, lang.file_extension, lang.image, dockerfile
        );
    }
    Ok(())
}

/// `docker build` arguments for a language's image
fn docker_build_args(lang: &LanguageEntry, context_dir: &Path, no_cache: bool) -> Vec<String> {
    let mut docker_args = vec![
        "build".to_string(),
        "-t".to_string(),
        lang.image.clone(),
        "-f".to_string(),
        context_dir.join("Dockerfile").to_string_lossy().to_string(),
    ];

    if no_cache {
        docker_args.push("--no-cache".to_string());
    }

    // Build context goes last
    docker_args.push(context_dir.to_string_lossy().to_string());
    docker_args
}

/// Build the Docker image for a language from its Dockerfile directory
pub fn build_docker_image(config_path: &Path, name: Language, no_cache: bool) -> Result<()> {
    println!("🐳 Building Docker image for: {}", name);

    let config = load_languages_config(config_path)?;
    let lang = find_language(&config, name)?;

    let context_dir = match &lang.dockerfile_dir {
        Some(dir) => dir,
        None => bail!(
            "Language '{}' has no dockerfile_dir; its image {} is pulled, not built",
            name,
            lang.image
        ),
    };
    let dockerfile_path = context_dir.join("Dockerfile");
    if !dockerfile_path.exists() {
        bail!("Dockerfile not found at {}", dockerfile_path.display());
    }

    let docker_args = docker_build_args(lang, context_dir, no_cache);
    println!("🔨 Running: docker {}", docker_args.join(" "));

    let status = Command::new("docker")
        .args(&docker_args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to execute docker build. Is Docker installed and running?")?;

    if !status.success() {
        bail!("Docker build failed with exit code: {:?}", status.code());
    }

    println!("✅ Image {} built successfully!", lang.image);
    Ok(())
}

fn new_submission(code: String, language: Language, problem_id: i64) -> SubmissionRequest {
    SubmissionRequest {
        submission_uuid: Uuid::new_v4(),
        problem_id,
        user_uuid: Uuid::new_v4(),
        language,
        timestamp: chrono::Utc::now().timestamp(),
        code,
    }
}

/// Send a source file to a running engine
pub async fn submit(engine_url: &str, file: &Path, language: Language, problem_id: i64) -> Result<()> {
    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let submission = new_submission(code, language, problem_id);

    let url = endpoints::execute_url(engine_url);
    println!("📤 Submitting {} to {}", file.display(), url);

    let response = reqwest::Client::new()
        .post(&url)
        .json(&submission)
        .send()
        .await
        .with_context(|| format!("Failed to reach engine at {}", engine_url))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!("Engine rejected submission ({}): {}", status, body);
    }

    println!("✅ Accepted: submission {}", submission.submission_uuid);
    println!("   The verdict is written to the database service when the run finishes.");
    Ok(())
}
