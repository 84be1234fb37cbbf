use std::collections::BTreeMap;

use crate::error::{HcpError, Result};
use crate::model::ProcessConfigs;
use crate::plan::Topology;

pub const GENERAL_TEMPLATE: &str = "setup-general.sh";
pub const MASTER_TEMPLATE: &str = "setup-master.sh";

const DELIMITER: &str = "%%%";

pub type Bindings = BTreeMap<String, String>;

/// Expands `%%%name%%%` placeholders in named script templates.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    templates: BTreeMap<String, String>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl TemplateRenderer {
    pub fn empty() -> Self {
        TemplateRenderer {
            templates: BTreeMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut renderer = Self::empty();
        renderer.register(
            GENERAL_TEMPLATE,
            include_str!("../templates/setup-general.sh.template"),
        );
        renderer.register(
            MASTER_TEMPLATE,
            include_str!("../templates/setup-master.sh.template"),
        );
        renderer
    }

    pub fn register(&mut self, name: &str, text: &str) {
        self.templates.insert(name.to_string(), text.to_string());
    }

    /// Single pass over the template: substituted values are never scanned
    /// again. A placeholder without a binding is an error.
    pub fn render(&self, template_name: &str, bindings: &Bindings) -> Result<String> {
        let template = self
            .templates
            .get(template_name)
            .ok_or_else(|| HcpError::Render(format!("unknown template '{}'", template_name)))?;

        let mut out = String::with_capacity(template.len());
        let mut rest = template.as_str();
        while let Some(start) = rest.find(DELIMITER) {
            let after = &rest[start + DELIMITER.len()..];
            let Some(end) = after.find(DELIMITER) else {
                break;
            };
            let key = &after[..end];
            if !is_placeholder(key) {
                out.push_str(&rest[..start + DELIMITER.len()]);
                rest = after;
                continue;
            }

            let value = bindings.get(key).ok_or_else(|| {
                HcpError::Render(format!(
                    "template '{}' needs a value for '{}'",
                    template_name, key
                ))
            })?;
            out.push_str(&rest[..start]);
            out.push_str(value);
            rest = &after[end + DELIMITER.len()..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn is_placeholder(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Bindings for the Hadoop setup scripts of a node running `configs`.
pub fn hadoop_bindings(topology: &Topology, configs: &ProcessConfigs) -> Bindings {
    let hosts = std::iter::once(&topology.master)
        .chain(&topology.slaves)
        .map(|n| format!("{} {}", n.internal_ip, n.hostname))
        .collect::<Vec<_>>()
        .join("\n");
    let slaves = topology
        .slaves
        .iter()
        .map(|n| n.hostname.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    Bindings::from([
        ("master_hostname".to_string(), topology.master.hostname.clone()),
        ("master_ip".to_string(), topology.master.ip.clone()),
        ("hosts".to_string(), hosts),
        ("slaves".to_string(), slaves),
        ("fs_default_name".to_string(), topology.fs_default_name()),
        ("job_tracker".to_string(), topology.job_tracker()),
        ("process_env".to_string(), process_env(configs)),
    ])
}

/// `export` lines for `hadoop-env.sh`. `heap_size` becomes the JVM `-Xmx` of
/// the process, every other key is exported as-is.
fn process_env(configs: &ProcessConfigs) -> String {
    let mut lines = Vec::new();
    for (process, values) in configs {
        let prefix = format!("HADOOP_{}", process.replace('_', "").to_uppercase());
        for (key, value) in values {
            let value = escape(value);
            if key == "heap_size" {
                lines.push(format!("export {}_OPTS=\"-Xmx{}m\"", prefix, value));
            } else {
                lines.push(format!("export {}_{}=\"{}\"", prefix, key.to_uppercase(), value));
            }
        }
    }
    lines.join("\n")
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`")
}
