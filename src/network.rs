use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyDesc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2addr: Option<String>,
}

/// Topology as written in the description file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDesc {
    pub site: String,
    pub sink: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<ProxyDesc>,
    pub edgelist: Vec<(String, String)>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Radio topology of one experiment.
#[derive(Debug, Clone)]
pub struct Network {
    site: String,
    sink: String,
    proxies: Vec<String>,
    nodes: Vec<String>,
    edges: BTreeMap<String, BTreeSet<String>>,
    l2addrs: BTreeMap<String, String>,
}

impl Network {
    pub fn new(
        desc: &NetworkDesc,
        l2addrs: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigurationError> {
        let l2addrs: BTreeMap<String, String> = l2addrs
            .iter()
            .map(|(n, a)| (node_name(n).to_owned(), a.clone()))
            .collect();
        let sink = node_name(&desc.sink).to_owned();

        let mut nodes: Vec<String> = vec![];
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (a, b) in &desc.edgelist {
            let (a, b) = (node_name(a).to_owned(), node_name(b).to_owned());
            for n in [&a, &b] {
                if !nodes.contains(n) {
                    nodes.push(n.clone());
                }
            }
            edges.entry(a.clone()).or_default().insert(b.clone());
            edges.entry(b).or_default().insert(a);
        }

        if !nodes.contains(&sink) {
            return Err(ConfigurationError::invalid(format!(
                "sink {} is not part of the edge list",
                sink
            )));
        }

        let mut proxies = vec![];
        for proxy in &desc.proxies {
            let name = node_name(&proxy.name).to_owned();
            if !nodes.contains(&name) {
                return Err(ConfigurationError::invalid(format!(
                    "proxy {} is not part of the edge list",
                    name
                )));
            }
            if let (Some(own), Some(listed)) = (&proxy.l2addr, l2addrs.get(&name)) {
                if !own.eq_ignore_ascii_case(listed) {
                    return Err(ConfigurationError::invalid(format!(
                        "proxy {} has l2addr {} but l2addrs lists {}",
                        name, own, listed
                    )));
                }
            }
            proxies.push(name);
        }

        for n in &nodes {
            if !l2addrs.contains_key(n) {
                return Err(ConfigurationError::invalid(format!(
                    "node {} has no l2addrs entry",
                    n
                )));
            }
        }

        Ok(Network {
            site: desc.site.clone(),
            sink,
            proxies,
            nodes,
            edges,
            l2addrs,
        })
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    /// All nodes in order of first appearance in the edge list.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn non_sink(&self) -> Vec<&str> {
        self.nodes().filter(|n| *n != self.sink).collect()
    }

    pub fn is_proxy(&self, name: &str) -> bool {
        self.proxies.iter().any(|p| p == name)
    }

    /// Nodes that issue queries.
    pub fn is_source(&self, name: &str) -> bool {
        self.contains(name) && name != self.sink && !self.is_proxy(name)
    }

    pub fn neighbors(&self, name: &str) -> Vec<&str> {
        self.edges
            .get(name)
            .map(|n| n.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Hop count along the edge list.
    pub fn distance(&self, from: &str, to: &str) -> Option<usize> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        let mut seen = BTreeSet::from([from]);
        let mut queue = VecDeque::from([(from, 0)]);
        while let Some((node, dist)) = queue.pop_front() {
            if node == to {
                return Some(dist);
            }
            for n in self.neighbors(node) {
                if seen.insert(n) {
                    queue.push_back((n, dist + 1));
                }
            }
        }
        None
    }

    /// Closest proxy, ties going to the one declared first.
    pub fn nearest_proxy(&self, source: &str) -> Option<&str> {
        let mut best: Option<(&str, usize)> = None;
        for proxy in &self.proxies {
            if let Some(d) = self.distance(source, proxy) {
                if best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((proxy.as_str(), d));
                }
            }
        }
        best.map(|(p, _)| p)
    }

    pub fn l2addr(&self, name: &str) -> Option<&str> {
        self.l2addrs.get(name).map(String::as_str)
    }

    /// Testbed host name of a node, e.g. `m3-2.grenoble.iot-lab.info`.
    pub fn uri(&self, name: &str) -> String {
        format!("{}.{}.iot-lab.info", name, self.site)
    }
}

/// `m3-12.grenoble.iot-lab.info` -> `m3-12`
pub fn node_name(uri: &str) -> &str {
    uri.split('.').next().unwrap_or(uri)
}

/// `nrf52840dk-7` -> `nrf52840dk`
pub fn archi(name: &str) -> &str {
    name.rsplit_once('-').map_or(name, |(a, _)| a)
}

/// `nrf52840dk-7` -> `7`
pub fn number(name: &str) -> &str {
    name.rsplit_once('-').map_or(name, |(_, n)| n)
}
