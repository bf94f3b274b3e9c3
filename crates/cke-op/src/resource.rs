use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::ca::CaName;
use cke_core::node::Node;
use cke_core::record::Command;
use cke_core::resource::{
    ANNOTATION_INJECT_CACERT, ANNOTATION_ISSUE_CERT, ANNOTATION_ISSUE_ETCD_CLIENT, ResourceDefinition,
    fill_tls_secret, inject_ca_bundle,
};
use cke_infra::vault::CertRequest;
use serde_json::Value;
use tracing::info;

use crate::operator::{Commander, RunContext, Sequence};

/// Lifetime of certificates issued into webhook Secrets.
pub const WEBHOOK_CERT_TTL: &str = "87600h";
/// Lifetime of etcd client certificates issued into Secrets.
pub const ETCD_CLIENT_CERT_TTL: &str = "87600h";

/// DNS names a webhook serving certificate for `service` in `namespace` must carry.
fn webhook_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
    ]
}

/// Body to apply for `def`, with any requested CA bundle or certificate filled in.
pub async fn prepare_body(ctx: &RunContext<'_>, def: &ResourceDefinition) -> Result<Value> {
    let mut body = def.applied_body();
    if let Some(user) = def.annotation(ANNOTATION_ISSUE_ETCD_CLIENT).filter(|s| !s.is_empty()) {
        fill_etcd_client_secret(ctx, def, user, &mut body).await?;
        return Ok(body);
    }
    let wants_ca = def.annotation(ANNOTATION_INJECT_CACERT) == Some("true");
    let issue_for = def.annotation(ANNOTATION_ISSUE_CERT).filter(|s| !s.is_empty());
    if !wants_ca && issue_for.is_none() {
        return Ok(body);
    }

    let ca_pem = ctx
        .infra
        .storage()
        .get_ca_certificate(CaName::Webhook)
        .await
        .context("load webhook CA certificate")?;
    if wants_ca {
        inject_ca_bundle(&mut body, &ca_pem);
    }
    if let Some(service) = issue_for {
        if def.kind != "Secret" {
            anyhow::bail!("{}: {ANNOTATION_ISSUE_CERT} is only valid on a Secret", def.key);
        }
        let names = webhook_names(service, &def.namespace);
        let req = CertRequest::new(names[2].clone(), WEBHOOK_CERT_TTL)
            .with_alt_names(names)
            .with_role(cke_infra::vault::ISSUE_ROLE);
        let issued = ctx
            .infra
            .certs()
            .issue(CaName::Webhook, &req)
            .await
            .with_context(|| format!("issue certificate for {}", def.key))?;
        fill_tls_secret(&mut body, &issued.certificate, &issued.private_key, &ca_pem);
    }
    Ok(body)
}

async fn fill_etcd_client_secret(ctx: &RunContext<'_>, def: &ResourceDefinition, user: &str, body: &mut Value) -> Result<()> {
    if def.kind != "Secret" {
        anyhow::bail!("{}: {ANNOTATION_ISSUE_ETCD_CLIENT} is only valid on a Secret", def.key);
    }
    let ca_pem = ctx
        .infra
        .storage()
        .get_ca_certificate(CaName::Server)
        .await
        .context("load server CA certificate")?;
    let issued = ctx
        .infra
        .certs()
        .issue(CaName::EtcdClient, &CertRequest::new(user, ETCD_CLIENT_CERT_TTL))
        .await
        .with_context(|| format!("issue etcd client certificate for {}", def.key))?;
    fill_tls_secret(body, &issued.certificate, &issued.private_key, &ca_pem);
    Ok(())
}

pub struct ApplyResource {
    pub api_node: Node,
    pub def: ResourceDefinition,
}

#[async_trait]
impl Commander for ApplyResource {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let kube = ctx.infra.kube(ctx.cluster, &self.api_node).await?;
        let body = prepare_body(ctx, &self.def).await?;
        kube.apply(&self.def, &body)
            .await
            .with_context(|| format!("apply {}", self.def.key))?;
        info!(resource = %self.def.key, revision = self.def.revision, "resource applied");
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("apply-resource", self.def.key.clone()).with_detail(self.def.revision.to_string())
    }
}

/// Apply `defs`, already filtered and in rank order.
pub fn apply_op(api_node: &Node, defs: Vec<ResourceDefinition>) -> Sequence {
    let targets = defs.iter().map(|d| d.key.clone()).collect();
    let steps: Vec<Box<dyn Commander>> = defs
        .into_iter()
        .map(|def| {
            Box::new(ApplyResource {
                api_node: api_node.clone(),
                def,
            }) as Box<dyn Commander>
        })
        .collect();
    Sequence::new("resource-apply", targets, steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::run_to_end;
    use crate::testutil::{ctx, seed_cas, test_cluster};
    use cke_core::resource::{ANNOTATION_REVISION, parse_resources};
    use cke_core::status::ResourceStatus;
    use cke_infra::fake::FakeInfra;

    const DEFS: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: app
---
apiVersion: v1
kind: Secret
metadata:
  name: webhook-cert
  namespace: app
  annotations:
    cke.cybozu.com/issue-cert: hook
---
apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: hook
  annotations:
    cke.cybozu.com/inject-cacert: "true"
webhooks:
  - name: hook.app.svc
    clientConfig:
      service: {name: hook, namespace: app}
"#;

    #[tokio::test]
    async fn test_apply_fills_webhook_material() {
        let infra = FakeInfra::new();
        seed_cas(&infra).await;
        let c = test_cluster(1, 0);
        let mut defs = parse_resources(DEFS).unwrap();
        for (i, d) in defs.iter_mut().enumerate() {
            d.revision = 10 + i as i64;
        }
        let mut op = apply_op(&c.nodes[0], defs.clone());
        let done = run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap();
        assert_eq!(done.len(), 3);

        let st = infra.kube.state();
        let (_, secret) = st.applied.iter().find(|(k, _)| k == "Secret/app/webhook-cert").unwrap();
        assert_eq!(secret["type"], "kubernetes.io/tls");
        assert!(secret["data"]["tls.crt"].is_string());
        let (_, hook) = st.applied.iter().find(|(k, _)| k.starts_with("ValidatingWebhook")).unwrap();
        assert!(hook["webhooks"][0]["clientConfig"]["caBundle"].is_string());

        // The applied revision annotation makes the definitions up to date.
        for d in &defs {
            let rs = ResourceStatus {
                annotations: st.annotations[&d.key].clone(),
            };
            assert_eq!(rs.annotations[ANNOTATION_REVISION], d.revision.to_string());
            assert!(!d.need_update(Some(&rs)));
        }
        drop(st);
        let issued = infra.certs.issued.lock().unwrap().clone();
        assert_eq!(issued, vec![(CaName::Webhook, "hook.app.svc".to_string())]);
    }

    #[tokio::test]
    async fn test_apply_issues_etcd_client_secret() {
        let infra = FakeInfra::new();
        seed_cas(&infra).await;
        let c = test_cluster(1, 0);
        let defs = parse_resources(
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: etcdbackup\n  namespace: kube-system\n  annotations:\n    cke.cybozu.com/issue-etcd-client: root\n",
        )
        .unwrap();
        let mut op = apply_op(&c.nodes[0], defs);
        run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap();

        let st = infra.kube.state();
        let (_, secret) = st.applied.iter().find(|(k, _)| k == "Secret/kube-system/etcdbackup").unwrap();
        assert_eq!(secret["type"], "kubernetes.io/tls");
        assert!(secret["data"]["ca.crt"].is_string());
        drop(st);
        let issued = infra.certs.issued.lock().unwrap().clone();
        assert_eq!(issued, vec![(CaName::EtcdClient, "root".to_string())]);
    }

    #[tokio::test]
    async fn test_issue_cert_requires_secret() {
        let infra = FakeInfra::new();
        seed_cas(&infra).await;
        let c = test_cluster(1, 0);
        let defs = parse_resources(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n  namespace: app\n  annotations:\n    cke.cybozu.com/issue-cert: x\n",
        )
        .unwrap();
        let mut op = apply_op(&c.nodes[0], defs);
        let err = run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap_err();
        assert!(err.to_string().contains("only valid on a Secret"));
    }
}
