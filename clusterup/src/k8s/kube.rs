//! Control-plane capability, consumed through kubectl.
//!
//! Namespaces and secrets are built as JSON manifests (secret values
//! base64-encoded at rest) and fed to `kubectl apply`, so everything that
//! reaches the cluster goes through one reviewed path.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::errors::{InstallerError, InstallerResult};
use crate::proc::{CommandSpec, SharedRunner};

/// kubectl against the local k3s kubeconfig.
#[derive(Clone)]
pub struct Kubectl {
    runner: SharedRunner,
    kubeconfig: PathBuf,
}

impl Kubectl {
    pub fn new(runner: SharedRunner, kubeconfig: PathBuf) -> Self {
        Self { runner, kubeconfig }
    }

    fn spec(&self) -> CommandSpec {
        CommandSpec::new("kubectl").env("KUBECONFIG", self.kubeconfig.display().to_string())
    }

    /// Does the kubectl client respond at all? Used as the "distribution
    /// already installed" signal.
    pub async fn client_present(&self) -> InstallerResult<bool> {
        self.runner.run_ok(&self.spec().arg("--help")).await
    }

    /// Is the cluster-level metrics capability queryable yet? k3s is not
    /// considered up until this answers.
    pub async fn metrics_available(&self) -> InstallerResult<bool> {
        self.runner
            .run_ok(
                &self
                    .spec()
                    .args(["get", "--raw", "/apis/metrics.k8s.io/v1beta1/pods"]),
            )
            .await
    }

    /// Does a secret already exist? Used as the "this stage already ran"
    /// signal for steps whose durable output is a cluster secret.
    pub async fn secret_exists(&self, namespace: &str, name: &str) -> InstallerResult<bool> {
        self.runner
            .run_ok(
                &self
                    .spec()
                    .args(["get", "secret", name, "--namespace", namespace]),
            )
            .await
    }

    /// Create a namespace, tolerating one that already exists.
    pub async fn create_namespace(&self, name: &str) -> InstallerResult<()> {
        let output = self
            .runner
            .run(&self.spec().args(["create", "namespace", name]))
            .await?;
        if output.success() || output.stderr.contains("AlreadyExists") {
            Ok(())
        } else {
            Err(InstallerError::Command {
                program: "kubectl".to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    pub async fn apply_file(&self, path: &Path) -> InstallerResult<()> {
        self.runner
            .run_checked(
                &self
                    .spec()
                    .args(["apply", "-f", &path.display().to_string()]),
            )
            .await?;
        Ok(())
    }

    /// Apply manifest contents by writing them to a temporary file first.
    pub async fn apply_manifest(&self, name: &str, contents: &str) -> InstallerResult<()> {
        let mut file = tempfile::Builder::new()
            .prefix(name)
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        self.apply_file(file.path()).await
    }

    pub async fn create_opaque_secret(
        &self,
        namespace: &str,
        name: &str,
        fields: &[(&str, &str)],
    ) -> InstallerResult<()> {
        let manifest = opaque_secret_manifest(namespace, name, fields);
        self.apply_manifest(name, &manifest.to_string()).await
    }

    pub async fn create_image_pull_secret(
        &self,
        namespace: &str,
        name: &str,
        registry: &str,
        username: &str,
        password: &str,
    ) -> InstallerResult<()> {
        let manifest = image_pull_secret_manifest(namespace, name, registry, username, password)?;
        self.apply_manifest(name, &manifest.to_string()).await
    }
}

/// Opaque secret manifest with values base64-encoded at rest.
pub fn opaque_secret_manifest(namespace: &str, name: &str, fields: &[(&str, &str)]) -> Value {
    let mut data = Map::new();
    for (key, value) in fields {
        data.insert(key.to_string(), json!(BASE64.encode(value)));
    }

    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": name, "namespace": namespace },
        "type": "Opaque",
        "data": Value::Object(data),
    })
}

/// dockerconfigjson pull secret for a private registry.
pub fn image_pull_secret_manifest(
    namespace: &str,
    name: &str,
    registry: &str,
    username: &str,
    password: &str,
) -> InstallerResult<Value> {
    let docker_config = json!({
        "auths": {
            registry: {
                "username": username,
                "password": password,
                "auth": BASE64.encode(format!("{username}:{password}")),
            }
        }
    });

    Ok(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": name, "namespace": namespace },
        "type": "kubernetes.io/dockerconfigjson",
        "data": {
            ".dockerconfigjson": BASE64.encode(serde_json::to_string(&docker_config)?),
        },
    }))
}

/// Read the k3s agent join token written by the installer.
pub fn node_token(path: &Path) -> InstallerResult<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// Kubeconfig rewritten for remote access and base64-encoded for transport
/// inside the cluster secret.
pub fn remote_kubeconfig_b64(kubeconfig: &Path, host_url: &str) -> InstallerResult<String> {
    let contents = std::fs::read_to_string(kubeconfig)?;
    let remote = contents.replace(
        "server: https://127.0.0.1:6443",
        &format!("server: https://{host_url}:6443"),
    );
    Ok(BASE64.encode(remote))
}
