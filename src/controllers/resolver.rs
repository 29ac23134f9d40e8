use std::{fmt, net::Ipv6Addr, time::Duration};

use anyhow::Context;
use serde::Serialize;

use crate::{
    descs::{Method, ResponseDelay, Run, Transport},
    error::{ConfigurationError, RemoteError},
    utils::{ssh::RemoteShell, tmux::Pane, Session},
};

pub const OSCORE_KEYDIR: &str = "oscore_server_creds/from-client1/";
pub const DTLS_CLIENT_IDENTITY: &str = "Client_identity";
pub const DTLS_PSK: &str = "secretPSK";

/// Resolver ports per scheme. CoAPS always listens one above CoAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTable {
    pub udp: u16,
    pub dtls: u16,
    pub coap: u16,
}

pub const BASELINE_PORTS: PortTable = PortTable {
    udp: 5300,
    dtls: 8530,
    coap: 8383,
};

/// Lets a second dispatcher share the frontend.
pub const ALTERNATE_PORTS: PortTable = PortTable {
    udp: 5301,
    dtls: 8531,
    coap: 8483,
};

impl PortTable {
    pub fn coaps(&self) -> u16 {
        self.coap + 1
    }

    pub fn port(&self, transport: Transport) -> u16 {
        match transport {
            Transport::Udp => self.udp,
            Transport::Dtls => self.dtls,
            Transport::Coap | Transport::Oscore => self.coap,
            Transport::Coaps => self.coaps(),
        }
    }

    /// Ports the border router forwards, as `--udp-ports` wants them.
    pub fn csv(&self) -> String {
        format!("{},{},{},{}", self.udp, self.dtls, self.coap, self.coaps())
    }
}

/// Where nodes send their queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverEndpoint {
    transport: Transport,
    host: Ipv6Addr,
    port: u16,
    method: Option<Method>,
}

impl ResolverEndpoint {
    pub fn new(transport: Transport, host: Ipv6Addr, ports: &PortTable, method: Option<Method>) -> Self {
        ResolverEndpoint {
            transport,
            host,
            port: ports.port(transport),
            method,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn host(&self) -> Ipv6Addr {
        self.host
    }
}

impl fmt::Display for ResolverEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.transport.is_coap() {
            return write!(f, "[{}]:{}", self.host, self.port);
        }
        write!(
            f,
            "{}://[{}]:{}/dns-query",
            self.transport.scheme(),
            self.host,
            self.port
        )?;
        if self.method == Some(Method::Get) {
            f.write_str("{?dns}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct DtlsTimings {
    server_hello_done_delay: f64,
    finish_delay: f64,
}

#[derive(Debug, Serialize)]
struct DtlsCredentials {
    client_identity: String,
    psk: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Records {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Serialize)]
struct InRecords {
    #[serde(rename = "A")]
    a: String,
    #[serde(rename = "AAAA")]
    aaaa: Records,
}

#[derive(Debug, Serialize)]
struct MockUpstream {
    #[serde(rename = "IN")]
    records: InRecords,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_delay: Option<ResponseDelay>,
}

#[derive(Debug, Serialize)]
struct Binding {
    host: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    use_etag: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_age: Option<String>,
}

#[derive(Debug, Serialize)]
struct Transports {
    udp: Binding,
    dtls: Binding,
    coap: Binding,
}

#[derive(Debug, Serialize)]
struct OscoreCredentials {
    keydir: String,
    client_id: String,
}

/// Configuration document of the stub resolver for one run.
#[derive(Debug, Serialize)]
pub struct ResolverConfig {
    dtls: DtlsTimings,
    dtls_credentials: DtlsCredentials,
    mock_dns_upstream: MockUpstream,
    transports: Transports,
    #[serde(skip_serializing_if = "Option::is_none")]
    oscore_credentials: Option<OscoreCredentials>,
}

impl ResolverConfig {
    pub fn for_run(run: &Run, transport: Transport, host: Ipv6Addr, ports: &PortTable) -> Self {
        let max_age = run.args.max_age_mode.clone();
        let binding = |port: u16| Binding {
            host: host.to_string(),
            port,
            use_etag: None,
            max_age: None,
        };
        let aaaa = if max_age.is_some() {
            Records::Many(
                ["2001:db8::7", "2001:db8::8", "2001:db8::9", "2001:db8::10"]
                    .iter()
                    .map(|a| a.to_string())
                    .collect(),
            )
        } else {
            Records::One("2001:db8::7".to_owned())
        };

        ResolverConfig {
            dtls: DtlsTimings {
                server_hello_done_delay: 0.04,
                finish_delay: 0.04,
            },
            dtls_credentials: DtlsCredentials {
                client_identity: DTLS_CLIENT_IDENTITY.to_owned(),
                psk: DTLS_PSK.to_owned(),
            },
            mock_dns_upstream: MockUpstream {
                records: InRecords {
                    a: "10.0.0.7".to_owned(),
                    aaaa,
                },
                ttl: max_age.as_ref().map(|_| [2, 8]),
                response_delay: run
                    .args
                    .response_delay
                    .clone()
                    .filter(|d| d.queries.is_some()),
            },
            transports: Transports {
                udp: binding(ports.udp),
                dtls: binding(ports.dtls),
                coap: Binding {
                    use_etag: max_age.as_ref().map(|_| true),
                    max_age,
                    ..binding(ports.coap)
                },
            },
            oscore_credentials: (transport == Transport::Oscore).then(|| OscoreCredentials {
                keydir: OSCORE_KEYDIR.to_owned(),
                client_id: ":client1".to_owned(),
            }),
        }
    }
}

/// Interface carrying the frontend's IPv6 default route.
pub fn default_interface(ip_route: &str) -> Option<&str> {
    ip_route
        .lines()
        .filter(|l| l.starts_with("default"))
        .find_map(|l| {
            let mut words = l.split_whitespace();
            words.find(|w| *w == "dev")?;
            words.next()
        })
}

/// First `scope global` address in `ip -6 addr show` output.
pub fn global_address(ip_addr: &str) -> Option<Ipv6Addr> {
    ip_addr
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("inet6 ") && l.contains("scope global"))
        .find_map(|l| l.split_whitespace().nth(1)?.split('/').next()?.parse().ok())
}

/// Global address of the frontend that nodes can reach.
pub fn bind_address(shell: &RemoteShell) -> anyhow::Result<Ipv6Addr> {
    let routes = shell.run_once("ip -6 route")?;
    let iface = default_interface(&routes).context("frontend has no IPv6 default route")?;
    let addrs = shell.run_once(&format!("ip -6 addr show dev {}", iface))?;
    let addr = global_address(&addrs)
        .with_context(|| format!("no global address on {}", iface))?;
    info!("resolver binds to {} on {}", addr, iface);
    Ok(addr)
}

/// Only a failing `test -x` means the virtualenv is missing. SSH trouble is
/// passed on as is.
pub fn check_virtualenv(shell: &RemoteShell, virtualenv: &str) -> anyhow::Result<()> {
    match shell.run_once(&format!("test -x {}/bin/aiodns-proxy", virtualenv)) {
        Ok(_) => Ok(()),
        Err(RemoteError::Failed { .. }) => {
            Err(ConfigurationError::MissingVirtualenv(virtualenv.to_owned()).into())
        }
        Err(e) => Err(e.into()),
    }
}

struct Running {
    pane: Pane,
    config: String,
    oscore: bool,
}

/// Stub resolver process on the frontend.
pub struct Resolver {
    session: Session,
    virtualenv: String,
    verbosity: String,
    ports: PortTable,
    control_path: String,
    running: Option<Running>,
}

impl Resolver {
    pub fn new(
        session: Session,
        virtualenv: &str,
        verbosity: &str,
        ports: PortTable,
        control_path: String,
    ) -> Self {
        Resolver {
            session,
            virtualenv: virtualenv.to_owned(),
            verbosity: verbosity.to_owned(),
            ports,
            control_path,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn pane(&self) -> Option<&Pane> {
        self.running.as_ref().map(|r| &r.pane)
    }

    pub fn start(&mut self, run: &Run, host: Ipv6Addr) -> anyhow::Result<ResolverEndpoint> {
        self.stop();
        let transport = run.transport()?;
        let Session { shell, tmux, clock, .. } = &self.session;

        shell.close_master(&self.control_path);
        let pane = tmux.get_or_create("resolver")?;

        let config = ResolverConfig::for_run(run, transport, host, &self.ports);
        let config = serde_yaml::to_string(&config)?;
        let path = shell.run_once("mktemp")?.trim().to_owned();
        self.running = Some(Running {
            pane: pane.clone(),
            config: path.clone(),
            oscore: transport == Transport::Oscore,
        });
        shell
            .write_file(&path, &config)
            .context("uploading resolver config")?;

        tmux.send_line(&pane, &shell.open_master(&self.control_path))?;
        clock.sleep(Duration::from_secs(1));
        tmux.send_line(
            &pane,
            &format!(
                "{}/bin/aiodns-proxy -v {} -C {}",
                self.virtualenv, self.verbosity, path
            ),
        )?;
        clock.sleep(Duration::from_secs(3));

        let endpoint = ResolverEndpoint::new(transport, host, &self.ports, run.args.method);
        info!("resolver up for {}", endpoint);
        Ok(endpoint)
    }

    /// Safe to call any number of times.
    pub fn stop(&mut self) {
        let running = match self.running.take() {
            Some(r) => r,
            None => return,
        };
        let Session { shell, tmux, clock, .. } = &self.session;
        info!("stopping resolver");

        for _ in 0..3 {
            if let Err(e) = tmux.interrupt(&running.pane) {
                warn!("interrupting resolver failed: {}", e);
            }
            clock.sleep(Duration::from_secs(3));
        }
        if let Err(e) = shell.run_once("pkill -f aiodns-proxy") {
            debug!("pkill aiodns-proxy: {}", e);
        }
        if running.oscore {
            if let Err(e) = shell.run_once(&format!("rm -f {}lock", OSCORE_KEYDIR)) {
                warn!("removing OSCORE replay lock failed: {}", e);
            }
        }
        if let Err(e) = shell.run_once(&format!("rm -v {}", running.config)) {
            warn!("removing resolver config failed: {}", e);
        }
        shell.close_master(&self.control_path);
    }
}
