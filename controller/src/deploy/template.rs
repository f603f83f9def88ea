use std::sync::Arc;

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use negotiator_core::{kube::KubeClient, Dispatched, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::{
    err::{Error, Result},
    renderer::Renderer,
    template::TemplateLoader,
};

use super::{Deployer, Template};

// Consts

const KIND_DEPLOYMENT: &str = "Deployment";
const KIND_SERVICE: &str = "Service";

// TemplateDeployer

/// Renders named liquid templates into a deployment and its services, and applies them.
pub struct TemplateDeployer<KUBE: KubeClient, LOADER: TemplateLoader, RENDERER: Renderer> {
    kube: Arc<KUBE>,
    loader: Arc<LOADER>,
    public_url: String,
    renderer: Arc<RENDERER>,
}

impl<KUBE: KubeClient, LOADER: TemplateLoader, RENDERER: Renderer>
    TemplateDeployer<KUBE, LOADER, RENDERER>
{
    pub fn new(
        kube: Arc<KUBE>,
        loader: Arc<LOADER>,
        public_url: String,
        renderer: Arc<RENDERER>,
    ) -> Self {
        Self {
            kube,
            loader,
            public_url: public_url.trim_end_matches('/').into(),
            renderer,
        }
    }
}

impl<KUBE: KubeClient, LOADER: TemplateLoader, RENDERER: Renderer> Deployer
    for TemplateDeployer<KUBE, LOADER, RENDERER>
{
    #[instrument(skip(self, ns, tpl), fields(resource.namespace = ns, template.name = %tpl.name))]
    async fn dispatch(&self, ns: &str, tpl: &Template) -> Result<Dispatched> {
        for svc in &tpl.services {
            let name = svc.metadata.name.as_ref().ok_or(Error::UnnamedResource)?;
            debug!(service.name = %name, "applying service");
            self.kube.patch_from(ns, name, svc).await?;
        }
        let name = tpl
            .deployment
            .metadata
            .name
            .clone()
            .ok_or(Error::UnnamedResource)?;
        debug!(deployment.name = %name, "applying deployment");
        self.kube.patch_from(ns, &name, &tpl.deployment).await?;
        info!(deployment.name = %name, "template dispatched");
        Ok(Dispatched {
            watch_url: format!("{}/deploy/status/{ns}/{name}", self.public_url),
            deployment_name: name,
        })
    }

    #[instrument(skip(self, ns, payload), fields(resource.namespace = ns))]
    fn load(&self, ns: &str, name: &str, payload: &Payload) -> Result<Template> {
        let src = self.loader.load(name)?;
        let vars = Variables {
            instance_id: payload.instance_id.clone(),
            name: name.into(),
            namespace: ns.into(),
            options: payload.options.clone(),
        };
        let mut yaml = vec![];
        self.renderer.render(&src, &vars, &mut yaml)?;
        parse_template(name, &yaml)
    }
}

// Variables

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Variables {
    instance_id: Option<String>,
    name: String,
    namespace: String,
    options: Map<String, Value>,
}

// Functions

fn parse_template(name: &str, yaml: &[u8]) -> Result<Template> {
    let decode_err = |source| Error::TemplateDecode {
        name: name.into(),
        source,
    };
    let mut deployment: Option<Deployment> = None;
    let mut services: Vec<Service> = vec![];
    for doc in serde_yaml::Deserializer::from_slice(yaml) {
        let obj = serde_yaml::Value::deserialize(doc).map_err(decode_err)?;
        if obj.is_null() {
            continue;
        }
        let kind = obj
            .get("kind")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            KIND_DEPLOYMENT => {
                deployment = Some(serde_yaml::from_value(obj).map_err(decode_err)?);
            }
            KIND_SERVICE => services.push(serde_yaml::from_value(obj).map_err(decode_err)?),
            _ => {
                return Err(Error::TemplateUnsupportedObject {
                    kind,
                    name: name.into(),
                })
            }
        }
    }
    let deployment = deployment.ok_or_else(|| Error::TemplateWithoutDeployment(name.into()))?;
    Ok(Template {
        annotations: deployment.metadata.annotations.clone().unwrap_or_default(),
        deployment,
        name: name.into(),
        services,
    })
}

// Tests
