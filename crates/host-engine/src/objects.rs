//! Management objects of the host filtering engine.

use std::net::IpAddr;

use serde::Serialize;
use split_core::{ClassifyContext, ClassifyEvent, ImagePath, Layer, ObjectKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provider {
    pub key: ObjectKey,
    pub name: String,
}

/// Ordered container of filters. Every sublayer gets to vote on every flow,
/// higher weight sublayers are evaluated first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sublayer {
    pub key: ObjectKey,
    pub name: String,
    pub provider: Option<ObjectKey>,
    pub weight: u16,
}

/// Declares that the classify function registered under `key` is attached
/// to `layer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalloutRegistration {
    pub key: ObjectKey,
    pub name: String,
    pub layer: Layer,
    pub provider: ObjectKey,
}

/// Match condition of a filter. All the conditions of a filter must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Condition {
    /// The owning process executable is any of these paths.
    AppPath(Vec<String>),
    /// The socket local address is any of these.
    LocalAddress(Vec<IpAddr>),
}

impl Condition {
    pub fn matches(&self, event: &ClassifyEvent) -> bool {
        match self {
            Condition::AppPath(paths) => {
                let process = app_id(&event.process.path);
                !process.is_empty() && paths.iter().any(|candidate| app_id(candidate) == process)
            }
            Condition::LocalAddress(addresses) => {
                let local = match &event.context {
                    ClassifyContext::Bind { local }
                    | ClassifyContext::Connect { local, .. }
                    | ClassifyContext::Flow { local, .. } => local.ip(),
                };
                addresses.contains(&local)
            }
        }
    }
}

/// The host identifies executables by their canonical path, the form the
/// classification store uses too.
fn app_id(path: &str) -> ImagePath {
    ImagePath::normalize(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterAction {
    Permit,
    Block,
    /// Ask the callout registered under this key.
    Callout(ObjectKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub key: ObjectKey,
    pub name: String,
    pub layer: Layer,
    pub sublayer: ObjectKey,
    pub provider: Option<ObjectKey>,
    pub weight: u16,
    pub conditions: Vec<Condition>,
    pub action: FilterAction,
}

impl Filter {
    pub fn matches(&self, event: &ClassifyEvent) -> bool {
        self.conditions.iter().all(|condition| condition.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use split_core::ProcessIdentity;

    use super::*;

    fn flow(path: &str, local: &str) -> ClassifyEvent {
        ClassifyEvent::auth_connect(
            ProcessIdentity::new(1, path),
            local.parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
        )
    }

    #[test]
    fn app_path_condition() {
        let condition = Condition::AppPath(vec![
            "C:\\Tools\\a.exe".to_string(),
            "c:/tools/b.exe".to_string(),
        ]);
        assert!(condition.matches(&flow("c:\\tools\\A.EXE", "10.0.0.2:5000")));
        assert!(condition.matches(&flow("C:\\TOOLS\\b.exe", "10.0.0.2:5000")));
        assert!(!condition.matches(&flow("c:\\tools\\c.exe", "10.0.0.2:5000")));
        assert!(!condition.matches(&flow("", "10.0.0.2:5000")));
        assert!(!Condition::AppPath(vec![]).matches(&flow("c:\\tools\\a.exe", "10.0.0.2:5000")));
    }

    #[test]
    fn app_path_condition_uses_canonical_form() {
        let condition = Condition::AppPath(vec!["c:\\tools\\a.exe".to_string()]);
        for reported in [
            "\\\\?\\C:\\Tools\\a.exe",
            "C:\\\\Tools\\\\a.exe",
            "//?/c:/tools//a.exe",
        ] {
            assert!(condition.matches(&flow(reported, "10.0.0.2:5000")), "{reported}");
        }
    }

    #[test]
    fn local_address_condition() {
        let condition = Condition::LocalAddress(vec!["10.0.0.2".parse().unwrap()]);
        assert!(condition.matches(&flow("c:\\a.exe", "10.0.0.2:5000")));
        assert!(!condition.matches(&flow("c:\\a.exe", "192.168.1.10:5000")));
    }
}
