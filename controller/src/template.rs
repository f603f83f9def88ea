use std::{fs::read_to_string, path::PathBuf};

use tracing::{debug, instrument};

use crate::err::{Error, Result};

// Consts

pub const JOB_TEMPLATE_MONGO: &str = "data-mongo-job";
pub const JOB_TEMPLATE_MYSQL: &str = "data-mysql-job";

const TEMPLATE_EXTENSION: &str = "yaml.liquid";

const BUILTINS: [(&str, &str); 2] = [
    (
        JOB_TEMPLATE_MONGO,
        include_str!("../resources/jobs/data-mongo-job.yaml.liquid"),
    ),
    (
        JOB_TEMPLATE_MYSQL,
        include_str!("../resources/jobs/data-mysql-job.yaml.liquid"),
    ),
];

// Traits

#[cfg_attr(test, mockall::automock)]
pub trait TemplateLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<String>;
}

// DefaultTemplateLoader

/// Loads `<name>.yaml.liquid` from a directory, falling back on templates bundled in the binary.
pub struct DefaultTemplateLoader {
    dir: Option<PathBuf>,
}

impl DefaultTemplateLoader {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }
}

impl TemplateLoader for DefaultTemplateLoader {
    #[instrument(skip(self))]
    fn load(&self, name: &str) -> Result<String> {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{name}.{TEMPLATE_EXTENSION}"));
            if path.is_file() {
                debug!(path = %path.display(), "reading template");
                return read_to_string(&path).map_err(|source| Error::TemplateLoad {
                    name: name.into(),
                    source,
                });
            }
        }
        debug!("using bundled template");
        BUILTINS
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, tpl)| (*tpl).into())
            .ok_or_else(|| Error::TemplateNotFound(name.into()))
    }
}

// Tests
