//! Add-on manifest templating and application.
//!
//! Manifests are compiled into the binary and applied in a fixed order.
//! Placeholder tokens (`${EMAIL}`, `${DOMAIN}`, ...) are substituted from
//! the install context before apply; a manifest with any unresolved token
//! is never applied.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::InstallerConfig;
use crate::errors::{InstallerError, InstallerResult};
use crate::proc::{CommandSpec, SharedRunner};
use crate::sequencer::{InstallCtx, ProvisionStep, Readiness};
use crate::system::primary_interface_ip;

use super::kube::Kubectl;

/// One embedded manifest template.
pub struct ManifestTemplate {
    pub name: &'static str,
    pub contents: &'static str,
    /// Fixed settle time after apply, for add-ons whose webhooks/controllers
    /// need to come up before the next manifest can be admitted.
    pub settle: Option<Duration>,
}

/// Add-on manifests, in application order. Load-balancer and certificate
/// manager come first since later add-ons depend on their admission
/// webhooks and address pools.
pub const DEPLOYMENTS: &[ManifestTemplate] = &[
    ManifestTemplate {
        name: "metallb-deployment",
        contents: include_str!("../../resources/deployments/loadbalancer/metallb-deployment.yaml"),
        settle: Some(Duration::from_secs(20)),
    },
    ManifestTemplate {
        name: "metallb-config",
        contents: include_str!("../../resources/deployments/loadbalancer/metallb-config.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "traefik-namespace",
        contents: include_str!("../../resources/deployments/traefik/traefik-namespace.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "traefik-helm",
        contents: include_str!("../../resources/deployments/traefik/traefik-helm.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "cert-manager",
        contents: include_str!("../../resources/deployments/certificates/cert-manager.yaml"),
        settle: Some(Duration::from_secs(45)),
    },
    ManifestTemplate {
        name: "lets-encrypt",
        contents: include_str!("../../resources/deployments/certificates/lets-encrypt.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "traefik-middleware",
        contents: include_str!("../../resources/deployments/certificates/traefik-middleware.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "dashboard-namespace",
        contents: include_str!("../../resources/deployments/dashboard/dashboard-namespace.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "dashboard",
        contents: include_str!("../../resources/deployments/dashboard/dashboard.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "nfs-provisioner-namespace",
        contents: include_str!(
            "../../resources/deployments/storage/nfs-provisioner-namespace.yaml"
        ),
        settle: None,
    },
    ManifestTemplate {
        name: "nfs-provisioner",
        contents: include_str!("../../resources/deployments/storage/nfs-provisioner.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "postgresql",
        contents: include_str!("../../resources/deployments/database/postgresql-deployment.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "redis",
        contents: include_str!("../../resources/deployments/cache/redis.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "cluster-access-control",
        contents: include_str!(
            "../../resources/deployments/access/cluster-access-control.yaml"
        ),
        settle: None,
    },
    ManifestTemplate {
        name: "descheduler-rbac",
        contents: include_str!("../../resources/deployments/descheduler/rbac.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "descheduler-configmap",
        contents: include_str!("../../resources/deployments/descheduler/configmap.yaml"),
        settle: None,
    },
    ManifestTemplate {
        name: "descheduler-deployment",
        contents: include_str!("../../resources/deployments/descheduler/deployment.yaml"),
        settle: None,
    },
];

/// Substitute every `${KEY}` occurrence from `vars`. Any token left after
/// substitution is an error carrying the token name.
pub fn render(name: &str, template: &str, vars: &[(&str, &str)]) -> InstallerResult<String> {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("${{{key}}}"), value);
    }

    if let Some(start) = rendered.find("${") {
        let rest = &rendered[start..];
        let token = rest
            .find('}')
            .map(|end| &rest[..=end])
            .unwrap_or(rest)
            .to_string();
        return Err(InstallerError::UnresolvedPlaceholder {
            manifest: name.to_string(),
            placeholder: token,
        });
    }

    Ok(rendered)
}

/// Random credential from uppercase letters and digits.
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Step: apply the add-on manifests.
///
/// Precondition: the generated-credential secrets already exist, meaning
/// the add-ons were deployed by an earlier run; skipping keeps a re-run
/// from rotating live passwords. Action: generates the dashboard, cache,
/// and metrics-database credentials, stores them as cluster secrets and
/// context outputs, then applies each manifest with placeholders
/// substituted. Readiness: the dashboard endpoint answers anything other
/// than 404.
pub struct ApplyAddonManifestsStep {
    runner: SharedRunner,
    kubectl: Kubectl,
    http: reqwest::Client,
    readiness: Readiness,
}

impl ApplyAddonManifestsStep {
    pub fn new(runner: SharedRunner, http: reqwest::Client, config: &InstallerConfig) -> Self {
        Self {
            kubectl: Kubectl::new(runner.clone(), config.paths.kubeconfig.clone()),
            runner,
            http,
            readiness: Readiness::new(config.dashboard_startup_timeout, Duration::from_secs(1)),
        }
    }

    async fn hostname(&self) -> InstallerResult<String> {
        let output = self
            .runner
            .run_checked(&CommandSpec::new("hostname"))
            .await?;
        Ok(output.stdout.trim().to_string())
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for ApplyAddonManifestsStep {
    fn name(&self) -> &str {
        "apply-addon-manifests"
    }

    async fn precondition(&self, ctx: &InstallCtx) -> InstallerResult<bool> {
        let ns = ctx.lock().await.config.cluster_namespace.clone();
        Ok(self.kubectl.secret_exists(&ns, "cache-credentials").await?
            && self
                .kubectl
                .secret_exists(&ns, "metrics-db-credentials")
                .await?)
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let config = ctx.lock().await.config.clone();

        let dashboard_password = generate_password(16);
        let cache_password = generate_password(16);
        let db_user = generate_password(8);
        let db_password = generate_password(16);

        {
            let mut ctx = ctx.lock().await;
            ctx.dashboard_password = Some(dashboard_password.clone());
            ctx.cache_password = Some(cache_password.clone());
            ctx.metrics_db_user = Some(db_user.clone());
            ctx.metrics_db_password = Some(db_password.clone());
        }

        let ns = &config.cluster_namespace;
        self.kubectl
            .create_opaque_secret(ns, "cache-credentials", &[("redis-pwd", &cache_password)])
            .await?;
        self.kubectl
            .create_opaque_secret(
                ns,
                "metrics-db-credentials",
                &[("user", &db_user), ("pwd", &db_password)],
            )
            .await?;

        let host_name = self.hostname().await?;
        let host_ip = primary_interface_ip()?.to_string();
        let vars: Vec<(&str, &str)> = vec![
            ("EMAIL", config.params.email.as_str()),
            ("DOMAIN", config.params.host_url.as_str()),
            ("DASHBOARD_PASSWORD", dashboard_password.as_str()),
            ("REDIS_PASSWORD", cache_password.as_str()),
            ("HOST_NAME", host_name.as_str()),
            ("HOST_IP", host_ip.as_str()),
        ];

        for template in DEPLOYMENTS {
            let rendered = render(template.name, template.contents, &vars)?;
            tracing::info!(manifest = template.name, "applying add-on manifest");
            self.kubectl.apply_manifest(template.name, &rendered).await?;

            if let Some(settle) = template.settle {
                tracing::info!(
                    manifest = template.name,
                    settle_secs = settle.as_secs(),
                    "waiting for add-on to settle"
                );
                tokio::time::sleep(settle).await;
            }
        }

        Ok(())
    }

    fn readiness(&self) -> Option<Readiness> {
        Some(self.readiness)
    }

    async fn ready(&self, ctx: &InstallCtx) -> InstallerResult<bool> {
        let url = ctx.lock().await.config.dashboard_url();
        match self.http.get(&url).send().await {
            Ok(response) => Ok(response.status() != reqwest::StatusCode::NOT_FOUND),
            // TLS/connection errors while the ingress is still wiring up.
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_all_occurrences() {
        let template = "issuer: ${EMAIL}\nhost: dashboard.${DOMAIN}\nalt: ${DOMAIN}\n";
        let rendered = render(
            "demo",
            template,
            &[("DOMAIN", "example.com"), ("EMAIL", "a@b.com")],
        )
        .unwrap();

        assert_eq!(
            rendered,
            "issuer: a@b.com\nhost: dashboard.example.com\nalt: example.com\n"
        );
        assert!(!rendered.contains("${"));
    }

    #[test]
    fn unresolved_placeholder_is_rejected_by_token_name() {
        let err = render("demo", "password: ${DASHBOARD_PASSWORD}\n", &[]).unwrap_err();
        match err {
            InstallerError::UnresolvedPlaceholder {
                manifest,
                placeholder,
            } => {
                assert_eq!(manifest, "demo");
                assert_eq!(placeholder, "${DASHBOARD_PASSWORD}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn every_embedded_manifest_renders_with_the_standard_vars() {
        let vars = [
            ("EMAIL", "ops@example.com"),
            ("DOMAIN", "cluster.example.com"),
            ("DASHBOARD_PASSWORD", "DASH1234"),
            ("REDIS_PASSWORD", "REDIS123"),
            ("HOST_NAME", "node-a"),
            ("HOST_IP", "203.0.113.7"),
        ];

        for template in DEPLOYMENTS {
            let rendered = render(template.name, template.contents, &vars)
                .unwrap_or_else(|e| panic!("{}: {e}", template.name));
            assert!(!rendered.contains("${"), "{} left a token", template.name);
        }
    }

    #[test]
    fn slow_addons_carry_settle_times() {
        let settle = |name: &str| {
            DEPLOYMENTS
                .iter()
                .find(|t| t.name == name)
                .and_then(|t| t.settle)
        };
        assert_eq!(settle("cert-manager"), Some(Duration::from_secs(45)));
        assert_eq!(settle("metallb-deployment"), Some(Duration::from_secs(20)));
        assert_eq!(settle("redis"), None);
    }

    #[tokio::test]
    async fn existing_credential_secrets_satisfy_the_addon_step() {
        use crate::config::{InstallParams, InstallerConfig};
        use crate::proc::test_support::RecordingRunner;
        use crate::sequencer::InstallContext;
        use std::sync::Arc;

        let config = InstallerConfig::new(InstallParams {
            host_url: "cluster.example.com".to_string(),
            email: "ops@example.com".to_string(),
            registry_url: "registry.example.com".to_string(),
            access_key: "token".to_string(),
            godaddy_access_key: "gd-key".to_string(),
            godaddy_secret: "gd-secret".to_string(),
        });

        let runner = Arc::new(RecordingRunner::default());
        let step =
            ApplyAddonManifestsStep::new(runner.clone(), reqwest::Client::new(), &config);
        let ctx = InstallContext::shared(config.clone());
        assert!(step.precondition(&ctx).await.unwrap());

        // A missing credential secret means the add-ons never deployed.
        let runner = Arc::new(RecordingRunner::with_responses(vec![(1, String::new())]));
        let step = ApplyAddonManifestsStep::new(runner, reqwest::Client::new(), &config);
        assert!(!step.precondition(&ctx).await.unwrap());
    }

    #[test]
    fn generated_passwords_use_the_restricted_charset() {
        let password = generate_password(16);
        assert_eq!(password.len(), 16);
        assert!(
            password
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );
    }
}
