// ABOUTME: Docker CLI commands run on a node over SSH to manage the service container.
// ABOUTME: Parses port and volume specs and quotes every argument for the remote shell.

use crate::registry::RegistryCredentials;
use crate::state::ServiceSpec;
use crate::types::ImageRef;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lines of container output kept when a start or readiness check fails.
pub const FAILURE_LOG_LINES: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A published port, `8080:80`, `80` or `53:53/udp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl FromStr for PortMapping {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid port mapping '{}'", spec);

        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (spec, Protocol::Tcp),
        };

        let (host_port, container_port) = match ports.split_once(':') {
            Some((host, container)) => (
                Some(host.parse().map_err(|_| invalid())?),
                container.parse().map_err(|_| invalid())?,
            ),
            None => (None, ports.parse().map_err(|_| invalid())?),
        };

        Ok(Self {
            host_port,
            container_port,
            protocol,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_port {
            Some(host) => write!(f, "{}:{}", host, self.container_port)?,
            // Unqualified ports are published on the same host port.
            None => write!(f, "{0}:{0}", self.container_port)?,
        }
        if self.protocol == Protocol::Udp {
            f.write_str("/udp")?;
        }
        Ok(())
    }
}

/// A bind mount. A bare path is mounted at the same path inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl FromStr for VolumeMount {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [path] => (*path, *path, false),
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => return Err(format!("invalid volume '{}'", spec)),
        };
        if source.is_empty() || !target.starts_with('/') {
            return Err(format!("invalid volume '{}'", spec));
        }
        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.target)?;
        if self.read_only {
            f.write_str(":ro")?;
        }
        Ok(())
    }
}

/// Everything `docker run` needs for one service container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: ImageRef,
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
}

impl RunSpec {
    /// Build from a service's desired state. A database endpoint is exposed
    /// as `DATABASE_URL` unless the service's `env` already sets it.
    pub fn from_spec(
        name: &str,
        image: &ImageRef,
        spec: &ServiceSpec,
        database_url: Option<&str>,
    ) -> Result<Self, String> {
        let ports = spec
            .ports
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<PortMapping>, _>>()?;
        let volumes = spec
            .volumes
            .iter()
            .map(|v| v.parse())
            .collect::<Result<Vec<VolumeMount>, _>>()?;

        let mut env = spec.env.clone();
        if let Some(url) = database_url {
            env.entry("DATABASE_URL".to_string())
                .or_insert_with(|| url.to_string());
        }

        Ok(Self {
            name: name.to_string(),
            image: image.clone(),
            ports,
            env,
            volumes,
        })
    }
}

/// Quote for a POSIX shell.
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Builds docker command lines for the node's shell.
#[derive(Debug, Clone, Copy)]
pub struct DockerCli {
    program: &'static str,
}

impl DockerCli {
    pub fn new(sudo: bool) -> Self {
        Self {
            program: if sudo { "sudo docker" } else { "docker" },
        }
    }

    /// `docker login` reading the password from stdin; returns the command and its input.
    pub fn login(&self, credentials: &RegistryCredentials) -> (String, Vec<u8>) {
        let mut command = format!(
            "{} login --username {} --password-stdin",
            self.program,
            quote(&credentials.username)
        );
        if let Some(server) = &credentials.server {
            command.push(' ');
            command.push_str(&quote(server));
        }
        (command, credentials.password.as_bytes().to_vec())
    }

    pub fn pull(&self, image: &ImageRef) -> String {
        format!("{} pull {}", self.program, quote(&image.to_string()))
    }

    /// Remove a container, succeeding when there is none.
    pub fn remove_if_exists(&self, name: &str) -> String {
        format!("{} rm -f {} >/dev/null 2>&1 || true", self.program, quote(name))
    }

    pub fn remove(&self, name: &str) -> String {
        format!("{} rm -f {}", self.program, quote(name))
    }

    pub fn stop(&self, name: &str) -> String {
        format!("{} stop {}", self.program, quote(name))
    }

    pub fn start(&self, name: &str) -> String {
        format!("{} start {}", self.program, quote(name))
    }

    pub fn rename(&self, from: &str, to: &str) -> String {
        format!("{} rename {} {}", self.program, quote(from), quote(to))
    }

    /// Prints the container id on success.
    pub fn run(&self, spec: &RunSpec) -> String {
        let mut parts = vec![
            format!("{} run -d", self.program),
            format!("--name={}", quote(&spec.name)),
            "--restart=unless-stopped".to_string(),
        ];
        for port in &spec.ports {
            parts.push(format!("-p {}", quote(&port.to_string())));
        }
        for (key, value) in &spec.env {
            parts.push(format!("-e {}", quote(&format!("{}={}", key, value))));
        }
        for volume in &spec.volumes {
            parts.push(format!("-v {}", quote(&volume.to_string())));
        }
        parts.push(quote(&spec.image.to_string()));
        parts.join(" ")
    }

    /// Prints `running`, `exited`, … for an existing container.
    pub fn status(&self, name: &str) -> String {
        format!(
            "{} inspect -f '{{{{.State.Status}}}}' {}",
            self.program,
            quote(name)
        )
    }

    /// Prints the container's current name with a leading `/`.
    pub fn name_of(&self, id: &str) -> String {
        format!("{} inspect -f '{{{{.Name}}}}' {}", self.program, quote(id))
    }

    pub fn exec_shell(&self, name: &str, command: &str) -> String {
        format!("{} exec {} sh -c {}", self.program, quote(name), quote(command))
    }

    pub fn logs(&self, name: &str, tail: u64) -> String {
        format!("{} logs --tail {} {} 2>&1", self.program, tail, quote(name))
    }

    /// Succeeds once the daemon on the node answers.
    pub fn probe(&self) -> String {
        format!("{} version --format '{{{{.Server.Version}}}}'", self.program)
    }
}
