use std::path::PathBuf;

use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;

use crate::platform::CloudError;
use crate::platform::CloudResult;

pub async fn init_kube_client(kubeconfig: Option<PathBuf>) -> CloudResult<Client> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                CloudError::Configuration {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(CloudError::Configuration {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(CloudError::Configuration {
                message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        // in-cluster or ~/.kube/config
        None => Client::try_default()
            .await
            .change_context(CloudError::Configuration {
                message: "Failed to create Kubernetes client".to_string(),
            })?,
    };
    Ok(client)
}

/// All nodes of the cluster.
pub async fn list_nodes(client: Client) -> CloudResult<Vec<Node>> {
    let nodes: Api<Node> = Api::all(client);
    let list = nodes
        .list(&ListParams::default())
        .await
        .change_context(CloudError::Transport {
            message: "Failed to list nodes".to_string(),
        })?;
    Ok(list.items)
}
