//! Simulator collaborator.
//!
//! Spawning robot models into a running Gazebo world is done by shelling
//! out to the simulator's own tooling; nothing here models the simulator
//! beyond those commands. Failures are reported to the caller, never
//! treated as fatal to the fleet.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One model spawn into a running world.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub world: String,
    pub model_file: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

async fn run(program: &str, args: &[String], workdir: Option<&Path>) -> Result<String> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    let out = cmd.output().await?;
    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&out.stderr));
    if !out.status.success() {
        return Err(Error::Engine(format!(
            "{program} exited with {}: {output}",
            out.status.code().unwrap_or(-1)
        )));
    }
    Ok(output)
}

/// Spawn a model into a running world through `ros_gz_sim`.
pub async fn spawn_model(req: &SpawnRequest) -> Result<()> {
    let args = vec![
        "run".to_string(),
        "ros_gz_sim".to_string(),
        "create".to_string(),
        "-world".to_string(),
        req.world.clone(),
        "-file".to_string(),
        req.model_file.clone(),
        "-name".to_string(),
        req.name.clone(),
        "-x".to_string(),
        req.x.to_string(),
        "-y".to_string(),
        req.y.to_string(),
        "-z".to_string(),
        req.z.to_string(),
    ];
    let output = run("ros2", &args, None).await?;
    debug!(model = %req.name, world = %req.world, output = %output, "Spawned model");
    Ok(())
}

/// Remove a previously spawned model from its world.
pub async fn remove_model(world: &str, name: &str) -> Result<()> {
    let args = vec![
        "service".to_string(),
        "-s".to_string(),
        format!("/world/{world}/remove"),
        "--reqtype".to_string(),
        "gz.msgs.Entity".to_string(),
        "--reptype".to_string(),
        "gz.msgs.Boolean".to_string(),
        "--timeout".to_string(),
        "5000".to_string(),
        "--req".to_string(),
        format!("name: \"{name}\" type: MODEL"),
    ];
    let output = run("gz", &args, None).await?;
    debug!(model = %name, world, output = %output, "Removed model");
    Ok(())
}

/// Worlds currently simulated on this host, by inspecting running
/// simulator processes. Degrades to an empty list when the process
/// table cannot be read.
pub async fn running_worlds() -> Vec<String> {
    let output = match run("ps", &["-eo".to_string(), "args".to_string()], None).await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "Cannot inspect simulator processes");
            return Vec::new();
        }
    };
    worlds_from_process_list(&output)
}

fn worlds_from_process_list(process_list: &str) -> Vec<String> {
    let mut worlds: Vec<String> = process_list
        .lines()
        .filter(|line| line.contains("gz sim") || line.contains("ruby"))
        .flat_map(|line| line.split_whitespace())
        .filter(|token| token.ends_with(".sdf"))
        .filter_map(|token| {
            Path::new(token)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .collect();
    worlds.sort();
    worlds.dedup();
    worlds
}
