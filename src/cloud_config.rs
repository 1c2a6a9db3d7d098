//! cloud-init templating for the OpenStack backend.
//!
//! Builds a `Data` from the already-encoded jit config string (the backend
//! contract only ever hands adapters a [`crate::runner::Runner`], whose
//! `encoded_jit_config` is opaque) and the `OpenstackConfig` of the group
//! being provisioned for.

use serde::Serialize;

use crate::backend::OpenstackConfig;

#[derive(Debug, Serialize)]
pub struct Data {
    pub write_files: Vec<WriteFile>,
    pub runcmd: Vec<String>,
}

impl Data {
    pub fn from_jit_config(encoded_jit_config: &str, config: &OpenstackConfig) -> Self {
        let template = include_str!("../scripts/start.sh");
        let content = template
            .replace("___JIT_CONFIG___", encoded_jit_config)
            .replace("___RUNNER_USER___", &config.runner_user)
            .replace("___RUNNER_GROUP___", &config.runner_group);

        Self {
            write_files: vec![WriteFile {
                path: "/start.sh".into(),
                permissions: "0755".into(),
                content,
            }],
            runcmd: vec!["/start.sh".into()],
        }
    }

    pub fn to_user_data(&self) -> serde_yaml::Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

#[derive(Debug, Serialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpenstackConfig {
        OpenstackConfig {
            cloud: "default".into(),
            image: "img".into(),
            flavor: "flavor".into(),
            network: "net".into(),
            key_name: "key".into(),
            runner_user: "runner".into(),
            runner_group: "runner".into(),
        }
    }

    #[test]
    fn embeds_jit_config_and_user_data_prefix() {
        let data = Data::from_jit_config("abc123", &config());
        let yaml = data.to_user_data().unwrap();
        assert!(yaml.starts_with("#cloud-config\n"));
        assert!(data.write_files[0].content.contains("abc123"));
    }
}
