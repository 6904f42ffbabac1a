// ABOUTME: Config scaffolding for the bootstrap command.
// ABOUTME: Writes a commented shipyard.yml template and an example service file.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::CONFIG_FILENAME;

pub fn template_yaml() -> &'static str {
    r#"provider:
  # Personal access token; keep it out of this file.
  token: { env: DIGITALOCEAN_TOKEN }
  region: ams3
  # node_image: docker-20-04
  # default_size: s-1vcpu-1gb
  # ssh_keys: ["ab:cd:ef:..."]

ssh:
  user: root
  # key_path: ~/.ssh/id_ed25519
  # Set to false and pre-populate known_hosts to pin node host keys.
  trust_first_connection: true
  command_timeout: 10m
  # sudo: true

# registry:
#   username: deployer
#   password: { env: REGISTRY_PASSWORD }
#   server: registry.example.com

# state_dir: ~/.local/state/shipyard
deployment_dir: deployment

# retry:
#   node_ready: { max_attempts: 60, initial_delay: 5s, max_delay: 30s, timeout: 10m }
"#
}

fn example_service_yaml() -> &'static str {
    r#"image: registry.example.com/acme/web
context: .
dockerfile: Dockerfile
ports:
  - "80:8000"
env:
  LOG_LEVEL: info
# volumes:
#   - /srv/media
# database:
#   engine: pg
#   size: db-s-1vcpu-1gb
readiness:
  settle: 5s
  # cmd: "curl -fs http://localhost:8000/health"
"#
}

/// Write `shipyard.yml` and `deployment/example.yml` into `dir`.
///
/// An existing `shipyard.yml` is kept unless `force` is set. Returns the
/// written config path.
pub fn bootstrap_config(dir: &Path, force: bool) -> Result<PathBuf> {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(config_path));
    }
    std::fs::write(&config_path, template_yaml())?;

    let deployment_dir = dir.join("deployment");
    std::fs::create_dir_all(&deployment_dir)?;
    let example = deployment_dir.join("example.yml");
    if !example.exists() {
        std::fs::write(&example, example_service_yaml())?;
    }

    Ok(config_path)
}
