use std::process::Command;

// ── Docker CLI helpers for the container sandbox provider ──────────────────

/// Label stamped on every sandbox container so orphans can be found and
/// garbage-collected even after the relay restarts.
pub const SANDBOX_LABEL: &str = "moor.sandbox";

/// Label carrying the owning session id.
pub const SESSION_LABEL: &str = "moor.session";

/// Checks if Docker is installed and the daemon is reachable.
pub fn is_docker_available() -> bool {
    Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Checks whether an image is already present in the local daemon cache.
/// A missing image is `Ok(false)`; any other inspect failure is an error.
pub fn image_exists_locally(image: &str) -> Result<bool, String> {
    let output = Command::new("docker")
        .args(["image", "inspect", "--format", "{{.Id}}", image])
        .output()
        .map_err(|e| format!("Failed to execute docker image inspect: {}", e))?;

    if output.status.success() {
        return Ok(true);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such image") {
        Ok(false)
    } else {
        Err(format!("Docker image inspect failed: {}", stderr))
    }
}

/// Pull an image from its registry.
pub fn pull_image(image: &str) -> Result<(), String> {
    let output = Command::new("docker")
        .arg("pull")
        .arg(image)
        .output()
        .map_err(|e| format!("Failed to execute docker pull: {}", e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(format!("Docker pull failed: {}", stderr))
    }
}

/// Resolve the content digest of a local image (`RepoDigests` first entry),
/// falling back to the image id when the image was never pulled from a
/// registry.
pub fn image_digest(image: &str) -> Result<String, String> {
    let output = Command::new("docker")
        .args([
            "inspect",
            "--format",
            "{{if .RepoDigests}}{{index .RepoDigests 0}}{{else}}{{.Id}}{{end}}",
            image,
        ])
        .output()
        .map_err(|e| format!("Failed to execute docker inspect: {}", e))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(format!("Docker inspect failed: {}", stderr))
    }
}

/// Current state of a container: `running`, `paused`, `exited`, ...
/// Returns `None` when the container does not exist.
pub fn container_state(container_id: &str) -> Option<String> {
    let output = Command::new("docker")
        .args(["inspect", "--format", "{{.State.Status}}", container_id])
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

/// List container ids carrying the sandbox label, optionally restricted to a
/// single session.
pub fn list_sandbox_containers(session_id: Option<&str>) -> Result<Vec<String>, String> {
    let mut cmd = Command::new("docker");
    cmd.args(["ps", "-aq", "--filter", &format!("label={}", SANDBOX_LABEL)]);
    if let Some(session_id) = session_id {
        cmd.args(["--filter", &format!("label={}={}", SESSION_LABEL, session_id)]);
    }

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to execute docker ps: {}", e))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(format!("Docker ps failed: {}", stderr))
    }
}

/// Freeze all processes in the container, preserving memory and workspace.
pub fn pause_container(container_id: &str) -> Result<(), String> {
    run_container_command("pause", container_id)
}

/// Unfreeze a paused container.
pub fn unpause_container(container_id: &str) -> Result<(), String> {
    run_container_command("unpause", container_id)
}

/// Remove a container. Missing containers are treated as already removed.
pub fn remove_container(container_id: &str, force: bool) -> Result<(), String> {
    let mut cmd = Command::new("docker");
    cmd.arg("rm");
    if force {
        cmd.arg("-f");
    }
    cmd.arg(container_id);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to execute docker rm: {}", e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            Ok(())
        } else {
            Err(format!("Failed to remove container: {}", stderr))
        }
    }
}

fn run_container_command(verb: &str, container_id: &str) -> Result<(), String> {
    let output = Command::new("docker")
        .arg(verb)
        .arg(container_id)
        .output()
        .map_err(|e| format!("Failed to execute docker {}: {}", verb, e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(format!("Docker {} failed: {}", verb, stderr))
    }
}
