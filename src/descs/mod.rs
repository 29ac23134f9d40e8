//! Experiment descriptions: the YAML ledger of pending and scheduled runs.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::{error::ConfigurationError, network::NetworkDesc};

mod name;
pub mod store;

pub use name::{run_stem, NameContext};

type Extra = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Dtls,
    Coap,
    Coaps,
    Oscore,
}

impl Transport {
    /// Scheme the resolver listens on. OSCORE rides on plain CoAP.
    pub fn scheme(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Dtls => "dtls",
            Transport::Coap | Transport::Oscore => "coap",
            Transport::Coaps => "coaps",
        }
    }

    pub fn is_coap(self) -> bool {
        matches!(self, Transport::Coap | Transport::Coaps | Transport::Oscore)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Oscore => "oscore",
            other => other.scheme(),
        };
        f.write_str(s)
    }
}

impl FromStr for Transport {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Transport::Udp),
            "dtls" => Ok(Transport::Dtls),
            "coap" => Ok(Transport::Coap),
            "coaps" => Ok(Transport::Coaps),
            "oscore" => Ok(Transport::Oscore),
            other => Err(ConfigurationError::invalid(format!(
                "unknown transport '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Fetch,
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Fetch => "fetch",
            Method::Get => "get",
            Method::Post => "post",
        })
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    A,
    AAAA,
}

impl RecordType {
    /// Address family argument of the node's `query` commands.
    pub fn family(self) -> &'static str {
        match self {
            RecordType::A => "inet",
            RecordType::AAAA => "inet6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkLayer {
    #[default]
    #[serde(rename = "ieee802154")]
    Ieee802154,
    #[serde(rename = "ble")]
    Ble,
}

impl fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkLayer::Ieee802154 => "ieee802154",
            LinkLayer::Ble => "ble",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseDelay {
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default)]
    pub queries: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_queries_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_delay: Option<ResponseDelay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<RecordType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_mode: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl RunArgs {
    /// Fills unset fields from `defaults`.
    pub fn or(&self, defaults: &RunArgs) -> RunArgs {
        let mut extra = defaults.extra.clone();
        extra.extend(self.extra.clone());
        RunArgs {
            method: self.method.or(defaults.method),
            avg_queries_per_sec: self.avg_queries_per_sec.or(defaults.avg_queries_per_sec),
            response_delay: self
                .response_delay
                .clone()
                .or_else(|| defaults.response_delay.clone()),
            record: self.record.or(defaults.record),
            proxied: self.proxied.or(defaults.proxied),
            max_age_mode: self
                .max_age_mode
                .clone()
                .or_else(|| defaults.max_age_mode.clone()),
            extra,
        }
    }
}

/// One parameterised step of an experiment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Run {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Value>,
    #[serde(default)]
    pub args: RunArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_layer: Option<LinkLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rebuild: bool,
    #[serde(flatten)]
    pub extra: Extra,
}

pub const DEFAULT_DNS_COUNT: u64 = 100;
pub const DEFAULT_AVG_QPS: f64 = 10.0;
pub const DEFAULT_RUN_NAME: &str = "{run[env][DNS_TRANSPORT]}";

impl Run {
    /// The run with the globals' defaults applied.
    pub fn merged(&self, globals: &Globals) -> Run {
        let mut env = globals.env.clone();
        env.extend(self.env.clone());
        Run {
            env,
            args: self.args.or(&globals.args),
            link_layer: self.link_layer.or(globals.link_layer),
            wait: self.wait,
            name: self.name.clone().or_else(|| globals.run_name.clone()),
            rebuild: self.rebuild,
            extra: self.extra.clone(),
        }
    }

    pub fn env_str(&self, key: &str) -> Option<String> {
        self.env.get(key).map(env_value)
    }

    pub fn transport(&self) -> Result<Transport, ConfigurationError> {
        self.env_str("DNS_TRANSPORT")
            .ok_or_else(|| ConfigurationError::invalid("run without DNS_TRANSPORT"))?
            .parse()
    }

    pub fn link_layer(&self) -> LinkLayer {
        self.link_layer.unwrap_or_default()
    }

    pub fn dns_count(&self) -> u64 {
        self.env_str("DNS_COUNT")
            .and_then(|c| c.parse().ok())
            .unwrap_or(DEFAULT_DNS_COUNT)
    }

    pub fn avg_queries_per_sec(&self) -> f64 {
        self.args.avg_queries_per_sec.unwrap_or(DEFAULT_AVG_QPS)
    }

    pub fn record(&self) -> RecordType {
        self.args.record.unwrap_or(RecordType::AAAA)
    }

    pub fn proxied(&self) -> bool {
        self.args.proxied.unwrap_or(false)
    }

    pub fn name_template(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_RUN_NAME)
    }

    /// Checks a merged run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.transport()?;
        if let Some(delay) = &self.args.response_delay {
            if delay.time.is_some() != delay.queries.is_some() {
                return Err(ConfigurationError::invalid(
                    "response_delay needs both time and queries, or neither",
                ));
            }
        }
        if self.avg_queries_per_sec() <= 0.0 {
            return Err(ConfigurationError::invalid(
                "avg_queries_per_sec must be positive",
            ));
        }
        match self.wait {
            Some(w) if w >= 0.0 => {}
            _ => return Err(ConfigurationError::invalid("run without a valid wait")),
        }
        run_stem(self, &NameContext::placeholder())?;
        Ok(())
    }
}

/// Environment values as handed to make.
pub fn env_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_owned(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim()
            .to_owned(),
    }
}

/// Runs sharing one reservation and firmware build.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareDesc {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flashfile: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesDesc {
    pub network: NetworkDesc,
    #[serde(default)]
    pub l2addrs: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Globals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "is_default_args")]
    pub args: RunArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_layer: Option<LinkLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodesDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_firmware: Option<FirmwareDesc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub firmwares: Vec<FirmwareDesc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

fn is_default_args(args: &RunArgs) -> bool {
    *args == RunArgs::default()
}

impl Globals {
    pub fn experiment_name(&self) -> &str {
        self.name.as_deref().unwrap_or("dns-eval")
    }
}

/// Parsed description file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Descriptions {
    pub globals: Globals,
    pub unscheduled: Vec<Group>,
    pub scheduled: BTreeMap<u64, Group>,
}

fn yaml_err(e: serde_yaml::Error) -> ConfigurationError {
    ConfigurationError::invalid(e.to_string())
}

impl Descriptions {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigurationError> {
        let root: Value = serde_yaml::from_str(text).map_err(yaml_err)?;
        let mapping = match root {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => return Err(ConfigurationError::invalid("top level must be a mapping")),
        };

        let mut descs = Descriptions::default();
        for (key, value) in mapping {
            match &key {
                Value::String(s) if s == "globals" => {
                    if !value.is_null() {
                        descs.globals = serde_yaml::from_value(value).map_err(yaml_err)?;
                    }
                }
                Value::String(s) if s == "unscheduled" => {
                    if !value.is_null() {
                        descs.unscheduled = serde_yaml::from_value(value).map_err(yaml_err)?;
                    }
                }
                _ => {
                    let exp_id = match &key {
                        Value::Number(n) => n.as_u64(),
                        Value::String(s) => s.parse().ok(),
                        _ => None,
                    }
                    .ok_or_else(|| {
                        ConfigurationError::invalid(format!("unexpected top-level key {:?}", key))
                    })?;
                    let group: Group = serde_yaml::from_value(value).map_err(yaml_err)?;
                    descs.scheduled.insert(exp_id, group);
                }
            }
        }
        Ok(descs)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigurationError> {
        let mut mapping = Mapping::new();
        mapping.insert(
            "globals".into(),
            serde_yaml::to_value(&self.globals).map_err(yaml_err)?,
        );
        mapping.insert(
            "unscheduled".into(),
            serde_yaml::to_value(&self.unscheduled).map_err(yaml_err)?,
        );
        for (exp_id, group) in &self.scheduled {
            mapping.insert(
                Value::Number((*exp_id).into()),
                serde_yaml::to_value(group).map_err(yaml_err)?,
            );
        }
        serde_yaml::to_string(&mapping).map_err(yaml_err)
    }

    /// Every run, merged with the globals, must be dispatchable.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let groups = self.unscheduled.iter().chain(self.scheduled.values());
        for (g, group) in groups.enumerate() {
            for (r, run) in group.runs.iter().enumerate() {
                run.merged(&self.globals).validate().map_err(|e| {
                    ConfigurationError::invalid(format!("group {} run {}: {}", g, r, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn run_count(&self) -> usize {
        self.unscheduled
            .iter()
            .chain(self.scheduled.values())
            .map(|g| g.runs.len())
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub const DESCS: &str = r#"
globals:
  name: dns-comp
  run_name: "{exp.name}-{run[env][DNS_TRANSPORT]}-{run[args][method]}"
  env:
    SITE_PREFIX: "2001:660:5307:3100::/57"
    DEFAULT_CHANNEL: 26
  duration: 120
  nodes:
    network:
      site: grenoble
      sink: m3-1
      edgelist:
        - [m3-1, m3-2]
        - [m3-2, m3-3]
    l2addrs:
      m3-1: "02:00:00:00:00:00:00:01"
      m3-2: "02:00:00:00:00:00:00:02"
      m3-3: "02:00:00:00:00:00:00:03"
  sink_firmware:
    path: ../../apps/border-router
  firmwares:
    - path: ../../apps/requester
  profiles: [sniffer16]
unscheduled:
  - runs:
      - env: {DNS_TRANSPORT: udp}
        args: {method: fetch, avg_queries_per_sec: 5}
        wait: 120
      - env: {DNS_TRANSPORT: coap}
        args: {method: get}
        wait: 120
        comment: keep me
  - runs:
      - env: {DNS_TRANSPORT: oscore}
        wait: 60
12345:
  duration: 60
  runs:
    - env: {DNS_TRANSPORT: dtls}
      wait: 90
"#;

    #[test]
    fn parse_partition() {
        let descs = Descriptions::from_yaml(DESCS).unwrap();
        assert_eq!(descs.unscheduled.len(), 2);
        assert_eq!(descs.scheduled.keys().copied().collect::<Vec<_>>(), vec![12345]);
        assert_eq!(descs.run_count(), 4);
        assert_eq!(descs.globals.profiles, vec!["sniffer16"]);
        descs.validate().unwrap();
    }

    #[test]
    fn unknown_keys_survive_rewrite() {
        let descs = Descriptions::from_yaml(DESCS).unwrap();
        let again = Descriptions::from_yaml(&descs.to_yaml().unwrap()).unwrap();
        assert_eq!(descs, again);
        assert_eq!(
            again.unscheduled[0].runs[1].extra.get("comment"),
            Some(&Value::from("keep me"))
        );
    }

    #[test]
    fn merge_prefers_run_values() {
        let descs = Descriptions::from_yaml(DESCS).unwrap();
        let run = descs.unscheduled[0].runs[0].merged(&descs.globals);

        assert_eq!(run.transport().unwrap(), Transport::Udp);
        assert_eq!(run.env_str("DEFAULT_CHANNEL").as_deref(), Some("26"));
        assert_eq!(run.avg_queries_per_sec(), 5.0);
        assert_eq!(run.link_layer(), LinkLayer::Ieee802154);
        assert_eq!(run.dns_count(), DEFAULT_DNS_COUNT);
        assert_eq!(run.record(), RecordType::AAAA);
    }

    #[test]
    fn bad_runs_are_rejected() {
        let globals = Globals::default();
        let run = |yaml: &str| serde_yaml::from_str::<Run>(yaml).unwrap().merged(&globals);

        assert!(run("{env: {DNS_TRANSPORT: quic}, wait: 1}").validate().is_err());
        assert!(run("{env: {}, wait: 1}").validate().is_err());
        assert!(run("{env: {DNS_TRANSPORT: udp}}").validate().is_err());
        assert!(run("{env: {DNS_TRANSPORT: udp}, wait: 1, args: {response_delay: {time: 1.0}}}")
            .validate()
            .is_err());
        assert!(run("{env: {DNS_TRANSPORT: udp}, wait: 1, args: {avg_queries_per_sec: 0}}")
            .validate()
            .is_err());
        assert!(run("{env: {DNS_TRANSPORT: udp}, wait: 1, args: {response_delay: {time: 1.0, queries: 5}}}")
            .validate()
            .is_ok());
    }

    #[test]
    fn bad_top_level_key() {
        assert!(Descriptions::from_yaml("scheduled: []\n").is_err());
    }

    #[test]
    fn transports() {
        assert_eq!("oscore".parse::<Transport>().unwrap().scheme(), "coap");
        assert!(Transport::Coaps.is_coap());
        assert_eq!(Transport::Oscore.to_string(), "oscore");
    }
}
