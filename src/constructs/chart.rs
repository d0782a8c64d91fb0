//! AN-010: Charts bound to a cluster: the web app chart (Service,
//! Deployment, HorizontalPodAutoscaler) and Helm releases.

use super::cluster::ClusterHandle;
use super::manifests::manifest_resource;
use crate::core::app::{App, NodeId};
use crate::core::types::{ResourceKind, ResourceNode, Value};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Web app chart settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebAppChartProps {
    pub image: String,
    /// Value of the `app` label shared by service, pods and selector
    pub app_label: String,
    pub deployment_name: String,
    pub namespace: Option<String>,
    pub replicas: u32,
    pub service_port: u32,
    pub container_port: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Average CPU utilization the autoscaler targets, in percent
    pub target_cpu: u32,
}

impl Default for WebAppChartProps {
    fn default() -> Self {
        Self {
            image: "paulbouwer/hello-kubernetes:1.7".to_string(),
            app_label: "hello-k8s".to_string(),
            deployment_name: "hello-deployment".to_string(),
            namespace: None,
            replicas: 2,
            service_port: 80,
            container_port: 8080,
            min_replicas: 2,
            max_replicas: 10,
            target_cpu: 80,
        }
    }
}

impl WebAppChartProps {
    fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::config("web app chart: image is empty"));
        }
        if self.min_replicas == 0 || self.min_replicas > self.max_replicas {
            return Err(Error::config(format!(
                "web app chart: need 0 < min_replicas <= max_replicas, got {} / {}",
                self.min_replicas, self.max_replicas
            )));
        }
        Ok(())
    }

    fn metadata(&self, name: &str) -> serde_json::Value {
        match &self.namespace {
            Some(ns) => json!({ "name": name, "namespace": ns }),
            None => json!({ "name": name }),
        }
    }

    /// The Kubernetes objects, in apply order.
    pub fn objects(&self) -> [(&'static str, serde_json::Value); 3] {
        let label = json!({ "app": self.app_label });
        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": self.metadata(&format!("{}-service", self.app_label)),
            "spec": {
                "type": "LoadBalancer",
                "ports": [{ "port": self.service_port, "targetPort": self.container_port }],
                "selector": label,
            },
        });
        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": self.metadata(&self.deployment_name),
            "spec": {
                "replicas": self.replicas,
                "selector": { "matchLabels": label },
                "template": {
                    "metadata": { "labels": label },
                    "spec": {
                        "containers": [{
                            "name": self.app_label,
                            "image": self.image,
                            "ports": [{ "containerPort": self.container_port }],
                        }],
                    },
                },
            },
        });
        let hpa = json!({
            "apiVersion": "autoscaling/v2",
            "kind": "HorizontalPodAutoscaler",
            "metadata": self.metadata(&format!("{}-hpa", self.app_label)),
            "spec": {
                "minReplicas": self.min_replicas,
                "maxReplicas": self.max_replicas,
                "scaleTargetRef": {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": self.deployment_name,
                },
                "metrics": [{
                    "type": "Resource",
                    "resource": {
                        "name": "cpu",
                        "target": { "type": "Utilization", "averageUtilization": self.target_cpu },
                    },
                }],
            },
        });
        [("Service", service), ("Deployment", deployment), ("Hpa", hpa)]
    }
}

/// Add a web app chart construct for `cluster`.
///
/// Each object is its own manifest resource; the autoscaler waits for the
/// deployment it scales.
pub fn add_web_app_chart(
    app: &mut App,
    scope: NodeId,
    id: &str,
    cluster: &ClusterHandle,
    props: &WebAppChartProps,
) -> Result<NodeId> {
    props.validate()?;
    let node = app.add_construct(scope, id)?;
    for (suffix, object) in props.objects() {
        let mut resource = manifest_resource(format!("{id}{suffix}"), cluster, vec![Value::from_json(&object)]);
        if suffix == "Hpa" {
            resource = resource.after(format!("{id}Deployment"));
        }
        app.add_resource(node, resource)?;
    }
    app.add_node_dependency(node, cluster.node)?;
    debug!(chart = %app.path(node), "added web app chart");
    Ok(node)
}

/// Helm release settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HelmChartProps {
    pub chart: String,

    #[serde(default)]
    pub repository: Option<String>,

    /// Release name, defaults to the chart name
    #[serde(default)]
    pub release: Option<String>,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub values: IndexMap<String, serde_yaml_ng::Value>,

    #[serde(default = "default_true")]
    pub create_namespace: bool,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl HelmChartProps {
    pub fn new(chart: impl Into<String>) -> Self {
        Self {
            chart: chart.into(),
            repository: None,
            release: None,
            namespace: default_namespace(),
            version: None,
            values: IndexMap::new(),
            create_namespace: true,
        }
    }
}

/// Add a Helm release construct for `cluster`.
pub fn add_helm_chart(
    app: &mut App,
    scope: NodeId,
    id: &str,
    cluster: &ClusterHandle,
    props: &HelmChartProps,
) -> Result<NodeId> {
    if props.chart.is_empty() {
        return Err(Error::config(format!("helm chart '{}': chart is empty", id)));
    }
    let mut values = IndexMap::new();
    for (k, v) in &props.values {
        let value = Value::from_yaml(v)
            .map_err(|e| Error::config(format!("helm chart '{}': values.{}: {}", id, k, e)))?;
        values.insert(k.clone(), value);
    }

    let node = app.add_construct(scope, id)?;
    let mut resource = ResourceNode::new(ResourceKind::HelmChart, format!("{id}Chart"))
        .prop("ClusterName", cluster.cluster_name.clone())
        .prop("Chart", props.chart.as_str())
        .prop("Release", props.release.as_deref().unwrap_or(&props.chart))
        .prop("Namespace", props.namespace.as_str())
        .prop("CreateNamespace", props.create_namespace);
    if let Some(repo) = &props.repository {
        resource = resource.prop("Repository", repo.as_str());
    }
    if let Some(version) = &props.version {
        resource = resource.prop("Version", version.as_str());
    }
    if !values.is_empty() {
        resource = resource.prop("Values", Value::Map(values));
    }
    app.add_resource(node, resource)?;
    app.add_node_dependency(node, cluster.node)?;
    debug!(chart = %app.path(node), helm = %props.chart, "added helm chart");
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructs::cluster::{add_cluster, ClusterProps};
    use crate::constructs::network::NetworkInputs;
    use crate::core::app::StackProps;
    use crate::core::synth::synthesize;

    fn app_with_cluster() -> (App, ClusterHandle) {
        let mut app = App::new("t");
        let eks = app.add_stack("Eks", StackProps::default()).unwrap();
        app.add_stack("Charts", StackProps::default()).unwrap();
        let inputs = NetworkInputs {
            subnet_ids: vec![Value::from("subnet-a")],
            security_group_ids: vec![],
            source: None,
        };
        let handle = add_cluster(&mut app, eks.node(), "Cluster", &inputs, &ClusterProps::new("Demo")).unwrap();
        (app, handle)
    }

    #[test]
    fn test_an010_web_app_chart_objects() {
        let (mut app, cluster) = app_with_cluster();
        let charts = app.stack("Charts").unwrap();
        add_web_app_chart(&mut app, charts.node(), "WebApp", &cluster, &WebAppChartProps::default()).unwrap();

        let assembly = synthesize(&app).unwrap();
        assert_eq!(assembly.apply_order, vec!["Eks", "Charts"]);
        let artifact = assembly.artifact("Charts").unwrap();

        let service = &artifact.resource("WebAppService").unwrap().properties["Manifest"][0];
        assert_eq!(service["spec"]["type"], "LoadBalancer");
        assert_eq!(service["spec"]["ports"][0]["port"], 80);
        assert_eq!(service["spec"]["ports"][0]["targetPort"], 8080);

        let hpa = artifact.resource("WebAppHpa").unwrap();
        assert_eq!(hpa.depends_on, vec!["WebAppDeployment"]);
        assert_eq!(hpa.properties["Manifest"][0]["spec"]["minReplicas"], 2);
        assert_eq!(hpa.properties["Manifest"][0]["spec"]["maxReplicas"], 10);
        assert_eq!(
            hpa.properties["ClusterName"],
            json!({ "Ref": "Eks.ClusterCluster.Name" })
        );
    }

    #[test]
    fn test_an010_web_app_chart_props_from_yaml() {
        let props: WebAppChartProps = serde_yaml_ng::from_str("image: nginx:1.25\nmax_replicas: 4\n").unwrap();
        assert_eq!(props.image, "nginx:1.25");
        assert_eq!(props.max_replicas, 4);
        assert_eq!(props.container_port, 8080);
    }

    #[test]
    fn test_an010_web_app_chart_bad_replicas() {
        let (mut app, cluster) = app_with_cluster();
        let charts = app.stack("Charts").unwrap();
        let props = WebAppChartProps {
            min_replicas: 5,
            max_replicas: 2,
            ..WebAppChartProps::default()
        };
        assert!(add_web_app_chart(&mut app, charts.node(), "WebApp", &cluster, &props).is_err());
        assert!(app.find("Charts/WebApp").is_none());
    }

    #[test]
    fn test_an010_helm_chart() {
        let (mut app, cluster) = app_with_cluster();
        let eks = app.stack("Eks").unwrap();
        let mut props = HelmChartProps::new("metrics-server");
        props.repository = Some("https://kubernetes-sigs.github.io/metrics-server/".into());
        props.namespace = "kube-system".into();
        props.values.insert(
            "args".into(),
            serde_yaml_ng::from_str("[--kubelet-insecure-tls]").unwrap(),
        );
        add_helm_chart(&mut app, eks.node(), "MetricsServer", &cluster, &props).unwrap();

        let assembly = synthesize(&app).unwrap();
        let chart = assembly.artifact("Eks").unwrap().resource("MetricsServerChart").unwrap();
        assert_eq!(chart.kind, ResourceKind::HelmChart);
        assert_eq!(chart.properties["Release"], "metrics-server");
        assert_eq!(chart.properties["Values"]["args"][0], "--kubelet-insecure-tls");
        assert!(chart.depends_on.contains(&"ClusterCluster".to_string()));
    }
}
