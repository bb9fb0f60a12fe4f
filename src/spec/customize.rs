//! Caller-supplied customizations of a launch specification.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ProvisionError;
use crate::readiness::WaitStrategy;
use crate::spec::{ContainerPort, FileMount, LaunchSpec};

type CustomizeFn = dyn Fn(LaunchSpec) -> Result<LaunchSpec, ProvisionError> + Send + Sync;

/// A transformation of a [`LaunchSpec`].
///
/// Customizations take the specification by value and return the new one,
/// so a sequence of them is a fold. They are cheap to clone and can be
/// reused across provisioning calls.
#[derive(Clone)]
pub struct Customization(Arc<CustomizeFn>);

impl Customization {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(LaunchSpec) -> Result<LaunchSpec, ProvisionError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Customization that edits the specification in place and cannot fail.
    pub fn edit<F>(f: F) -> Self
    where
        F: Fn(&mut LaunchSpec) + Send + Sync + 'static,
    {
        Self::new(move |mut spec| {
            f(&mut spec);
            Ok(spec)
        })
    }

    pub fn apply(&self, spec: LaunchSpec) -> Result<LaunchSpec, ProvisionError> {
        (self.0)(spec)
    }
}

impl fmt::Debug for Customization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Customization(..)")
    }
}

/// Replace the image.
pub fn with_image(image: impl Into<String>) -> Customization {
    let image = image.into();
    Customization::edit(move |spec| spec.image = image.clone())
}

/// Add or override one environment variable.
pub fn with_env(key: impl Into<String>, value: impl Into<String>) -> Customization {
    let (key, value) = (key.into(), value.into());
    Customization::edit(move |spec| {
        spec.env.insert(key.clone(), value.clone());
    })
}

/// Add or override several environment variables.
pub fn with_envs<I, K, V>(vars: I) -> Customization
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let vars: Vec<(String, String)> = vars
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    Customization::edit(move |spec| {
        spec.env.extend(vars.iter().cloned());
    })
}

/// Expose additional ports, given as `"8080"` or `"8080/tcp"`.
///
/// Port strings are parsed when the customization is applied; a bad one
/// fails the build.
pub fn with_exposed_ports<I, S>(ports: I) -> Customization
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let ports: Vec<String> = ports.into_iter().map(Into::into).collect();
    Customization::new(move |mut spec| {
        for port in &ports {
            spec.expose(port.parse::<ContainerPort>()?);
        }
        Ok(spec)
    })
}

/// Copy a host file into the sandbox before it starts.
pub fn with_file(
    host_path: impl Into<PathBuf>,
    container_path: impl Into<String>,
    mode: u32,
) -> Customization {
    let mount = FileMount {
        host_path: host_path.into(),
        container_path: container_path.into(),
        mode,
    };
    Customization::edit(move |spec| spec.files.push(mount.clone()))
}

/// Use an explicit readiness strategy. It is never overridden.
pub fn with_wait(strategy: WaitStrategy) -> Customization {
    Customization::edit(move |spec| spec.wait = Some(strategy.clone()))
}

/// Replace the command arguments.
pub fn with_cmd<I, S>(cmd: I) -> Customization
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cmd: Vec<String> = cmd.into_iter().map(Into::into).collect();
    Customization::edit(move |spec| spec.cmd = Some(cmd.clone()))
}

/// Replace the entrypoint.
pub fn with_entrypoint<I, S>(entrypoint: I) -> Customization
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let entrypoint: Vec<String> = entrypoint.into_iter().map(Into::into).collect();
    Customization::edit(move |spec| spec.entrypoint = Some(entrypoint.clone()))
}

/// Attach the sandbox to these networks, replacing earlier choices.
pub fn with_networks<I, S>(networks: I) -> Customization
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let networks: Vec<String> = networks.into_iter().map(Into::into).collect();
    Customization::edit(move |spec| spec.networks = networks.clone())
}

pub fn with_privileged(privileged: bool) -> Customization {
    Customization::edit(move |spec| spec.privileged = privileged)
}

pub fn with_label(key: impl Into<String>, value: impl Into<String>) -> Customization {
    let (key, value) = (key.into(), value.into());
    Customization::edit(move |spec| {
        spec.labels.insert(key.clone(), value.clone());
    })
}
