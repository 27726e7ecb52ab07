use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Backend endpoint a listen port forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Immutable listen port → backend table. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct PortRouter {
    routes: Arc<BTreeMap<u16, Backend>>,
}

impl PortRouter {
    pub fn new(routes: BTreeMap<u16, Backend>) -> Self {
        Self {
            routes: Arc::new(routes),
        }
    }

    pub fn route(&self, listen_port: u16) -> Option<&Backend> {
        self.routes.get(&listen_port)
    }

    /// Configured listen ports in ascending order.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.routes.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromIterator<(u16, Backend)> for PortRouter {
    fn from_iter<T: IntoIterator<Item = (u16, Backend)>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
