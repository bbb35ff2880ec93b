#![allow(dead_code)]

use crate::error::ParseError;
use serde_yaml::{Mapping, Value};

/// 单个代理节点的规范化描述。
///
/// 由 `convert::parse` 从各协议 URI 解析产生，或从 clash 风格的订阅文档
/// 反序列化产生。值类型，解析成功即完整，后续各阶段（去重、配置组装）
/// 只读取或复制，不做原地修改。
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyNode {
    /// 展示名，结果集内唯一；缺失时为 "unnamed"。
    pub name: String,

    /// 服务器地址（域名或 IP），解析时保证非空。
    pub server: String,

    /// 端口，1-65535，解析时校验。
    pub port: u16,

    /// 协议专属字段，按协议拆成不同变体，缺字段在解析期即失败。
    pub opts: ProtocolOptions,

    /// TLS 相关参数，未配置时为 None。
    pub tls: Option<TlsOptions>,

    /// 传输层（ws / h2 / grpc），tcp 时为 None。
    pub transport: Option<Transport>,

    /// ALPN 列表，逗号分隔形式在解析时拆开。
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOptions {
    Vmess {
        uuid: String,
        alter_id: u32,
        cipher: String,
    },
    Vless {
        uuid: String,
        /// 末尾 `!` 是 no-udp443 的标记，序列化时剥掉；`-udp443` 原样保留
        flow: Option<String>,
    },
    Trojan {
        password: String,
    },
    Shadowsocks {
        cipher: String,
        password: String,
    },
    ShadowsocksR {
        protocol: String,
        cipher: String,
        obfs: String,
        password: String,
        obfs_param: Option<String>,
        protocol_param: Option<String>,
        group: Option<String>,
    },
    Hysteria {
        auth: Option<String>,
        up: Option<String>,
        down: Option<String>,
        obfs: Option<String>,
        /// 多端口范围，如 "30000-40000"
        ports: Option<String>,
        fast_open: bool,
    },
    Hysteria2 {
        password: String,
        obfs: Option<String>,
        obfs_password: Option<String>,
        ports: Option<String>,
    },
    Http {
        username: Option<String>,
        password: Option<String>,
    },
    Socks5 {
        username: Option<String>,
        password: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsOptions {
    pub enabled: bool,
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    pub skip_cert_verify: Option<bool>,
    pub reality: Option<RealityOptions>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealityOptions {
    pub public_key: String,
    pub short_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    Ws {
        path: Option<String>,
        host: Option<String>,
    },
    H2 {
        path: Option<String>,
        hosts: Vec<String>,
    },
    Grpc {
        service_name: String,
    },
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Ws { .. } => "ws",
            Transport::H2 { .. } => "h2",
            Transport::Grpc { .. } => "grpc",
        }
    }
}

impl ProtocolOptions {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolOptions::Vmess { .. } => "vmess",
            ProtocolOptions::Vless { .. } => "vless",
            ProtocolOptions::Trojan { .. } => "trojan",
            ProtocolOptions::Shadowsocks { .. } => "ss",
            ProtocolOptions::ShadowsocksR { .. } => "ssr",
            ProtocolOptions::Hysteria { .. } => "hysteria",
            ProtocolOptions::Hysteria2 { .. } => "hysteria2",
            ProtocolOptions::Http { .. } => "http",
            ProtocolOptions::Socks5 { .. } => "socks5",
        }
    }

    /// 身份哈希用的鉴权要素：uuid 或密码，没有则为空串。
    pub fn secret(&self) -> &str {
        match self {
            ProtocolOptions::Vmess { uuid, .. } | ProtocolOptions::Vless { uuid, .. } => uuid,
            ProtocolOptions::Trojan { password }
            | ProtocolOptions::Shadowsocks { password, .. }
            | ProtocolOptions::ShadowsocksR { password, .. }
            | ProtocolOptions::Hysteria2 { password, .. } => password,
            ProtocolOptions::Hysteria { auth, .. } => auth.as_deref().unwrap_or(""),
            ProtocolOptions::Http { password, .. } | ProtocolOptions::Socks5 { password, .. } => {
                password.as_deref().unwrap_or("")
            }
        }
    }
}

fn s(v: &str) -> Value {
    Value::String(v.to_string())
}

fn put(m: &mut Mapping, key: &str, val: Value) {
    m.insert(s(key), val);
}

fn put_opt(m: &mut Mapping, key: &str, val: &Option<String>) {
    if let Some(v) = val {
        put(m, key, s(v));
    }
}

impl ProxyNode {
    pub fn kind(&self) -> &'static str {
        self.opts.kind()
    }

    pub fn sni(&self) -> Option<&str> {
        self.tls.as_ref().and_then(|t| t.sni.as_deref())
    }

    /// 渲染成引擎配置 proxies 列表里的一条（clash 风格 mapping）。
    /// flow 标记在这里剥掉，引擎只认识裸值。
    pub fn engine_value(&self) -> Value {
        let mut m = Mapping::new();
        put(&mut m, "name", s(&self.name));
        put(&mut m, "server", s(&self.server));
        put(&mut m, "port", Value::Number(self.port.into()));
        put(&mut m, "type", s(self.kind()));

        match &self.opts {
            ProtocolOptions::Vmess {
                uuid,
                alter_id,
                cipher,
            } => {
                put(&mut m, "uuid", s(uuid));
                put(&mut m, "alterId", Value::Number((*alter_id).into()));
                let cipher = if cipher.is_empty() { "auto" } else { cipher.as_str() };
                put(&mut m, "cipher", s(cipher));
                put(&mut m, "tls", Value::Bool(self.tls_enabled()));
                if let Some(sni) = self.sni() {
                    put(&mut m, "servername", s(sni));
                }
            }
            ProtocolOptions::Vless { uuid, flow } => {
                put(&mut m, "uuid", s(uuid));
                if let Some(flow) = flow {
                    let cleaned = flow
                        .strip_suffix("-udp443")
                        .or_else(|| flow.strip_suffix('!'))
                        .unwrap_or(flow.as_str());
                    put(&mut m, "flow", s(cleaned));
                }
                put(&mut m, "tls", Value::Bool(self.tls_enabled()));
                if let Some(sni) = self.sni() {
                    put(&mut m, "servername", s(sni));
                }
                if let Some(tls) = &self.tls {
                    put_opt(&mut m, "client-fingerprint", &tls.fingerprint);
                    if let Some(reality) = &tls.reality {
                        let mut r = Mapping::new();
                        put(&mut r, "public-key", s(&reality.public_key));
                        put(&mut r, "short-id", s(&reality.short_id));
                        put(&mut m, "reality-opts", Value::Mapping(r));
                    }
                }
            }
            ProtocolOptions::Trojan { password } => {
                put(&mut m, "password", s(password));
                if let Some(sni) = self.sni() {
                    put(&mut m, "sni", s(sni));
                }
            }
            ProtocolOptions::Shadowsocks { cipher, password } => {
                let cipher = if cipher.is_empty() { "auto" } else { cipher.as_str() };
                put(&mut m, "cipher", s(cipher));
                put(&mut m, "password", s(password));
            }
            ProtocolOptions::ShadowsocksR {
                protocol,
                cipher,
                obfs,
                password,
                obfs_param,
                protocol_param,
                group: _,
            } => {
                put(&mut m, "protocol", s(protocol));
                put(&mut m, "cipher", s(cipher));
                put(&mut m, "obfs", s(obfs));
                put(&mut m, "password", s(password));
                put_opt(&mut m, "obfs-param", obfs_param);
                put_opt(&mut m, "protocol-param", protocol_param);
            }
            ProtocolOptions::Hysteria {
                auth,
                up,
                down,
                obfs,
                ports,
                fast_open,
            } => {
                put_opt(&mut m, "auth-str", auth);
                put_opt(&mut m, "up", up);
                put_opt(&mut m, "down", down);
                put_opt(&mut m, "obfs", obfs);
                put_opt(&mut m, "ports", ports);
                if *fast_open {
                    put(&mut m, "fast-open", Value::Bool(true));
                }
                if let Some(sni) = self.sni() {
                    put(&mut m, "sni", s(sni));
                }
                if let Some(tls) = &self.tls {
                    put_opt(&mut m, "fingerprint", &tls.fingerprint);
                }
            }
            ProtocolOptions::Hysteria2 {
                password,
                obfs,
                obfs_password,
                ports,
            } => {
                put(&mut m, "password", s(password));
                put_opt(&mut m, "obfs", obfs);
                put_opt(&mut m, "obfs-password", obfs_password);
                put_opt(&mut m, "ports", ports);
                if let Some(sni) = self.sni() {
                    put(&mut m, "sni", s(sni));
                }
                if let Some(tls) = &self.tls {
                    put_opt(&mut m, "fingerprint", &tls.fingerprint);
                }
            }
            ProtocolOptions::Http { username, password } => {
                put_opt(&mut m, "username", username);
                put_opt(&mut m, "password", password);
                put(&mut m, "tls", Value::Bool(self.tls_enabled()));
            }
            ProtocolOptions::Socks5 { username, password } => {
                put_opt(&mut m, "username", username);
                put_opt(&mut m, "password", password);
            }
        }

        if let Some(tls) = &self.tls {
            if let Some(skip) = tls.skip_cert_verify {
                put(&mut m, "skip-cert-verify", Value::Bool(skip));
            }
        }

        if !self.alpn.is_empty() {
            let alpn = self.alpn.iter().map(|a| s(a)).collect();
            put(&mut m, "alpn", Value::Sequence(alpn));
        }

        if let Some(transport) = &self.transport {
            put(&mut m, "network", s(transport.kind()));
            match transport {
                Transport::Ws { path, host } => {
                    let mut opts = Mapping::new();
                    put_opt(&mut opts, "path", path);
                    if let Some(host) = host {
                        let mut headers = Mapping::new();
                        put(&mut headers, "Host", s(host));
                        put(&mut opts, "headers", Value::Mapping(headers));
                    }
                    put(&mut m, "ws-opts", Value::Mapping(opts));
                }
                Transport::H2 { path, hosts } => {
                    let mut opts = Mapping::new();
                    put_opt(&mut opts, "path", path);
                    if !hosts.is_empty() {
                        put(
                            &mut opts,
                            "host",
                            Value::Sequence(hosts.iter().map(|h| s(h)).collect()),
                        );
                    }
                    put(&mut m, "h2-opts", Value::Mapping(opts));
                }
                Transport::Grpc { service_name } => {
                    let mut opts = Mapping::new();
                    put(&mut opts, "grpc-service-name", s(service_name));
                    put(&mut m, "grpc-opts", Value::Mapping(opts));
                }
            }
        }

        Value::Mapping(m)
    }

    fn tls_enabled(&self) -> bool {
        self.tls.as_ref().map(|t| t.enabled).unwrap_or(false)
    }

    /// 从 clash 风格 mapping 还原节点，订阅文档直接给出这种形式。
    pub fn from_engine_value(value: &Value) -> Result<ProxyNode, ParseError> {
        let kind = get_str(value, "type")
            .ok_or_else(|| ParseError::NotANode(render_oneline(value)))?;

        let opts = match kind.as_str() {
            "vmess" => ProtocolOptions::Vmess {
                uuid: get_str(value, "uuid").ok_or(ParseError::MissingField("vmess", "uuid"))?,
                alter_id: get_u64(value, "alterId").unwrap_or(0) as u32,
                cipher: get_str(value, "cipher").unwrap_or_else(|| "auto".to_string()),
            },
            "vless" => ProtocolOptions::Vless {
                uuid: get_str(value, "uuid").ok_or(ParseError::MissingField("vless", "uuid"))?,
                flow: get_str(value, "flow"),
            },
            "trojan" => ProtocolOptions::Trojan {
                password: get_str(value, "password")
                    .ok_or(ParseError::MissingField("trojan", "password"))?,
            },
            "ss" => ProtocolOptions::Shadowsocks {
                cipher: get_str(value, "cipher").ok_or(ParseError::MissingField("ss", "cipher"))?,
                password: get_str(value, "password").unwrap_or_default(),
            },
            "ssr" => ProtocolOptions::ShadowsocksR {
                protocol: get_str(value, "protocol")
                    .ok_or(ParseError::MissingField("ssr", "protocol"))?,
                cipher: get_str(value, "cipher")
                    .ok_or(ParseError::MissingField("ssr", "cipher"))?,
                obfs: get_str(value, "obfs").ok_or(ParseError::MissingField("ssr", "obfs"))?,
                password: get_str(value, "password").unwrap_or_default(),
                obfs_param: get_str(value, "obfs-param"),
                protocol_param: get_str(value, "protocol-param"),
                group: get_str(value, "group"),
            },
            "hysteria" => ProtocolOptions::Hysteria {
                auth: get_str(value, "auth-str").or_else(|| get_str(value, "auth_str")),
                up: get_str(value, "up"),
                down: get_str(value, "down"),
                obfs: get_str(value, "obfs"),
                ports: get_str(value, "ports"),
                fast_open: get_bool(value, "fast-open").unwrap_or(false),
            },
            "hysteria2" => ProtocolOptions::Hysteria2 {
                password: get_str(value, "password")
                    .ok_or(ParseError::MissingField("hysteria2", "password"))?,
                obfs: get_str(value, "obfs"),
                obfs_password: get_str(value, "obfs-password"),
                ports: get_str(value, "ports"),
            },
            "http" => ProtocolOptions::Http {
                username: get_str(value, "username"),
                password: get_str(value, "password"),
            },
            "socks5" => ProtocolOptions::Socks5 {
                username: get_str(value, "username"),
                password: get_str(value, "password"),
            },
            other => return Err(ParseError::Unsupported(other.to_string())),
        };

        let server = get_str(value, "server").ok_or(ParseError::MissingField("proxy", "server"))?;
        if server.is_empty() {
            return Err(ParseError::MissingField("proxy", "server"));
        }
        let port = get_u64(value, "port")
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .ok_or(ParseError::MissingField("proxy", "port"))?;

        let mut name = get_str(value, "name").unwrap_or_default();
        if name.is_empty() {
            name = "unnamed".to_string();
        }

        let transport = match get_str(value, "network").as_deref() {
            Some("ws") => {
                let opts = value.get("ws-opts");
                Some(Transport::Ws {
                    path: opts.and_then(|o| get_str(o, "path")),
                    host: opts
                        .and_then(|o| o.get("headers"))
                        .and_then(|h| get_str(h, "Host")),
                })
            }
            Some("h2") => {
                let opts = value.get("h2-opts");
                Some(Transport::H2 {
                    path: opts.and_then(|o| get_str(o, "path")),
                    hosts: opts
                        .and_then(|o| get_string_list(o, "host"))
                        .unwrap_or_default(),
                })
            }
            Some("grpc") => Some(Transport::Grpc {
                service_name: value
                    .get("grpc-opts")
                    .and_then(|o| get_str(o, "grpc-service-name"))
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        let enabled = get_bool(value, "tls").unwrap_or(false);
        let sni = get_str(value, "servername").or_else(|| get_str(value, "sni"));
        let fingerprint =
            get_str(value, "client-fingerprint").or_else(|| get_str(value, "fingerprint"));
        let skip_cert_verify = get_bool(value, "skip-cert-verify");
        let reality = value.get("reality-opts").and_then(|r| {
            Some(RealityOptions {
                public_key: get_str(r, "public-key")?,
                short_id: get_str(r, "short-id").unwrap_or_default(),
            })
        });
        let tls = if enabled
            || sni.is_some()
            || fingerprint.is_some()
            || skip_cert_verify.is_some()
            || reality.is_some()
        {
            Some(TlsOptions {
                enabled,
                sni,
                fingerprint,
                skip_cert_verify,
                reality,
            })
        } else {
            None
        };

        Ok(ProxyNode {
            name,
            server,
            port,
            opts,
            tls,
            transport,
            alpn: get_string_list(value, "alpn").unwrap_or_default(),
        })
    }
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(v) => Some(v.clone()),
        Value::Number(v) => Some(v.to_string()),
        _ => None,
    }
}

fn get_u64(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(v) => v.as_u64(),
        Value::String(v) => v.trim().parse().ok(),
        _ => None,
    }
}

fn get_bool(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(v) => Some(*v),
        Value::String(v) => Some(v == "true" || v == "1"),
        _ => None,
    }
}

/// alpn 既可能是序列也可能是 "h2,http/1.1" 这种逗号串
fn get_string_list(value: &Value, key: &str) -> Option<Vec<String>> {
    match value.get(key)? {
        Value::Sequence(seq) => Some(
            seq.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        Value::String(v) => Some(v.replace(' ', "").split(',').map(str::to_string).collect()),
        _ => None,
    }
}

fn render_oneline(value: &Value) -> String {
    serde_yaml::to_string(value)
        .unwrap_or_default()
        .trim()
        .replace('\n', " ")
}
