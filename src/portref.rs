//! `PortRef` — the `(category, name, flavor?)` identifier for a port variant.

use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRef {
    pub category: String,
    pub name: String,
    pub flavor: Option<String>,
}

impl PortRef {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            flavor: None,
        }
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = Some(flavor.into());
        self
    }

    /// `category/name`, with no directory component.
    pub fn port_dir(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// Accepted syntaxes per spec: `category/name`, `category/name@flavor`,
    /// or an absolute directory (mapped to its trailing `category/name`).
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }

        if spec.starts_with('/') {
            let path = Path::new(spec);
            let mut components: Vec<&str> = path
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect();
            let name = components.pop()?;
            let category = components.pop()?;
            return Some(PortRef::new(category, name));
        }

        let (base, flavor) = match spec.split_once('@') {
            Some((base, flavor)) => (base, Some(flavor)),
            None => (spec, None),
        };
        let (category, name) = base.split_once('/')?;
        if category.is_empty() || name.is_empty() {
            return None;
        }
        let mut port_ref = PortRef::new(category, name);
        if let Some(flavor) = flavor {
            if !flavor.is_empty() {
                port_ref = port_ref.with_flavor(flavor);
            }
        }
        Some(port_ref)
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flavor {
            Some(flavor) => write!(f, "{}/{}@{}", self.category, self.name, flavor),
            None => write!(f, "{}/{}", self.category, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_category_name() {
        let r = PortRef::parse("editors/vim").unwrap();
        assert_eq!(r.category, "editors");
        assert_eq!(r.name, "vim");
        assert_eq!(r.flavor, None);
        assert_eq!(r.to_string(), "editors/vim");
    }

    #[test]
    fn parses_flavor_suffix() {
        let r = PortRef::parse("lang/python@py311").unwrap();
        assert_eq!(r.flavor.as_deref(), Some("py311"));
        assert_eq!(r.to_string(), "lang/python@py311");
    }

    #[test]
    fn parses_absolute_directory() {
        let r = PortRef::parse("/usr/ports/editors/vim").unwrap();
        assert_eq!(r.category, "editors");
        assert_eq!(r.name, "vim");
    }

    #[test]
    fn rejects_malformed_spec() {
        assert!(PortRef::parse("").is_none());
        assert!(PortRef::parse("justaname").is_none());
        assert!(PortRef::parse("/onlyonecomponent").is_none());
    }
}
