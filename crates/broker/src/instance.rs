use crate::errors::Error;

/// The `project:region:name` identifier of a managed database instance.
///
/// A project may itself be domain-scoped and contain a single colon
/// (`example.com:project`), in which case the rendered form carries four
/// colon-separated segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceName {
    project: String,
    region: String,
    name: String,
}

impl InstanceName {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::str::FromStr for InstanceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split(':').collect();

        let (project, region, name) = match parts.as_slice() {
            [project, region, name] => (project.to_string(), region, name),
            // Domain-scoped project, e.g. "example.com:project:region:name".
            [domain, project, region, name] => (format!("{domain}:{project}"), region, name),
            _ => return Err(Error::InvalidName(s.to_string())),
        };

        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::InvalidName(s.to_string()));
        }

        Ok(InstanceName {
            project,
            region: region.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for InstanceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.name)
    }
}
