//! 各协议分享链接与规范节点之间的双向编解码。
//!
//! 解析端尽量宽容：scheme 前的非 ASCII 杂质、缺 padding 的 base64、
//! 凭据段整体编码或局部编码的 ss 链接都能接受；字段缺失则严格拒绝，
//! 绝不吐出残缺节点。

use crate::common::utils::{
    b64_decode, b64_encode, b64_encode_safe, percent_decode, quote, strip_non_ascii,
};
use crate::error::ParseError;
use crate::model::{ProtocolOptions, ProxyNode, RealityOptions, TlsOptions, Transport};
use url::Url;

/// 把一条分享链接解析成规范节点。
pub fn parse(uri: &str) -> Result<ProxyNode, ParseError> {
    let (scheme, payload) = split_scheme(uri)?;
    let normalized = format!("{scheme}://{payload}");

    let mut node = match scheme.as_str() {
        "vmess" => parse_vmess(&percent_decode(payload))?,
        "ss" => parse_ss(&percent_decode(payload))?,
        "ssr" => parse_ssr(&percent_decode(payload))?,
        "trojan" => parse_trojan(&normalized)?,
        "vless" => parse_vless(&normalized)?,
        "hysteria" => parse_hysteria(payload)?,
        "hysteria2" => parse_hysteria2(payload)?,
        "http" => parse_http(&normalized, false)?,
        "https" => parse_http(&normalized, true)?,
        "socks5" => parse_socks5(&normalized)?,
        other => return Err(ParseError::Unsupported(other.to_string())),
    };

    if node.name.is_empty() {
        node.name = "unnamed".to_string();
    }
    Ok(node)
}

/// 序列化对所有协议变体都是全函数，枚举保证没有落空的分支。
pub fn serialize(node: &ProxyNode) -> String {
    match &node.opts {
        ProtocolOptions::Vmess { .. } => serialize_vmess(node),
        ProtocolOptions::Vless { .. } => serialize_vless(node),
        ProtocolOptions::Trojan { .. } => serialize_trojan(node),
        ProtocolOptions::Shadowsocks { .. } => serialize_ss(node),
        ProtocolOptions::ShadowsocksR { .. } => serialize_ssr(node),
        ProtocolOptions::Hysteria { .. } => serialize_hysteria(node),
        ProtocolOptions::Hysteria2 { .. } => serialize_hysteria2(node),
        ProtocolOptions::Http { .. } => serialize_http(node),
        ProtocolOptions::Socks5 { .. } => serialize_socks5(node),
    }
}

fn split_scheme(uri: &str) -> Result<(String, &str), ParseError> {
    let (scheme, payload) = uri
        .split_once("://")
        .ok_or_else(|| ParseError::NotANode(uri.to_string()))?;
    let mut scheme = if scheme.is_ascii() {
        scheme.to_string()
    } else {
        strip_non_ascii(scheme)
    };
    if scheme == "hy2" {
        scheme = "hysteria2".to_string();
    }
    Ok((scheme, payload))
}

fn parse_port(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|p| *p > 0)
}

// ---------------------------------------------------------------- vmess

fn parse_vmess(payload: &str) -> Result<ProxyNode, ParseError> {
    let not_a_node = || ParseError::NotANode(format!("vmess://{payload}"));
    let decoded = b64_decode(payload).ok_or_else(not_a_node)?;
    let v: serde_json::Value = serde_json::from_str(&decoded).map_err(|_| not_a_node())?;

    let server = json_str(&v, "add").ok_or(ParseError::MissingField("vmess", "add"))?;
    if server.is_empty() {
        return Err(ParseError::MissingField("vmess", "add"));
    }
    let port = json_str(&v, "port")
        .and_then(|p| parse_port(&p))
        .ok_or(ParseError::MissingField("vmess", "port"))?;
    let uuid = json_str(&v, "id").ok_or(ParseError::MissingField("vmess", "id"))?;
    let alter_id = json_str(&v, "aid")
        .and_then(|a| a.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let cipher = match json_str(&v, "scy") {
        Some(c) if !c.is_empty() => c,
        _ => "auto".to_string(),
    };

    let mut host = json_str(&v, "host").unwrap_or_default();
    // 很多源不填 host，域名型 server 可以直接顶上
    if host.is_empty() && !server.chars().all(|c| c.is_ascii_digit() || c == '.') {
        host = server.clone();
    }
    let path = json_str(&v, "path").unwrap_or_default();

    let transport = match json_str(&v, "net").as_deref().unwrap_or("tcp") {
        "ws" => Some(Transport::Ws {
            path: (!path.is_empty()).then(|| path.clone()),
            host: (!host.is_empty()).then(|| host.clone()),
        }),
        "h2" => Some(Transport::H2 {
            path: (!path.is_empty()).then(|| path.clone()),
            hosts: host
                .split(',')
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect(),
        }),
        "grpc" if !path.is_empty() => Some(Transport::Grpc {
            service_name: path.clone(),
        }),
        _ => None,
    };

    let enabled = json_str(&v, "tls").as_deref() == Some("tls");
    let sni = json_str(&v, "sni").filter(|s| !s.is_empty());
    let tls = (enabled || sni.is_some()).then(|| TlsOptions {
        enabled,
        sni,
        ..Default::default()
    });

    Ok(ProxyNode {
        name: percent_decode(&json_str(&v, "ps").unwrap_or_default()),
        server,
        port,
        opts: ProtocolOptions::Vmess {
            uuid,
            alter_id,
            cipher,
        },
        tls,
        transport,
        alpn: vec![],
    })
}

fn serialize_vmess(node: &ProxyNode) -> String {
    let (uuid, alter_id, cipher) = match &node.opts {
        ProtocolOptions::Vmess {
            uuid,
            alter_id,
            cipher,
        } => (uuid, alter_id, cipher),
        _ => unreachable!(),
    };
    let (net, host, path) = match &node.transport {
        Some(Transport::Ws { path, host }) => (
            "ws",
            host.clone().unwrap_or_default(),
            path.clone().unwrap_or_default(),
        ),
        Some(Transport::H2 { path, hosts }) => {
            ("h2", hosts.join(","), path.clone().unwrap_or_default())
        }
        Some(Transport::Grpc { service_name }) => ("grpc", String::new(), service_name.clone()),
        None => ("tcp", String::new(), String::new()),
    };

    let mut v = serde_json::json!({
        "v": "2",
        "ps": node.name,
        "add": node.server,
        "port": node.port.to_string(),
        "id": uuid,
        "aid": alter_id,
        "scy": cipher,
        "net": net,
        "type": "none",
        "host": host,
        "path": path,
        "tls": if node.tls.as_ref().map(|t| t.enabled).unwrap_or(false) { "tls" } else { "" },
    });
    if let Some(sni) = node.sni() {
        v["sni"] = serde_json::Value::String(sni.to_string());
    }
    format!("vmess://{}", b64_encode(&v.to_string()))
}

fn json_str(v: &serde_json::Value, key: &str) -> Option<String> {
    match v.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------- shadowsocks

fn parse_ss(payload: &str) -> Result<ProxyNode, ParseError> {
    let not_a_node = || ParseError::NotANode(format!("ss://{payload}"));
    let (config_part, name) = payload.split_once('#').unwrap_or((payload, ""));

    // 凭据段可能单独 base64，也可能整个 payload 一起 base64
    let cred_raw = config_part.split_once('@').map_or(config_part, |(c, _)| c);
    let mut decoded = b64_decode(cred_raw).ok_or_else(not_a_node)?;
    if decoded.starts_with("ss://") {
        let inner = decoded["ss://".len()..].to_string();
        decoded = b64_decode(&inner).ok_or_else(not_a_node)?;
    }

    let cred_part = if config_part.contains('@') {
        decoded.as_str()
    } else {
        decoded.split('@').next().unwrap_or("")
    };
    let (cipher, password) = match cred_part.split_once(':') {
        Some((c, p)) => (c.to_string(), p.to_string()),
        None => (cred_part.to_string(), String::new()),
    };
    if cipher.is_empty() {
        return Err(ParseError::MissingField("ss", "cipher"));
    }

    let server_info = match config_part.split_once('@') {
        Some((_, rest)) => rest.to_string(),
        None => decoded
            .split_once('@')
            .map(|(_, rest)| rest.to_string())
            .ok_or(ParseError::MissingField("ss", "server"))?,
    };
    let server_info = server_info.split('?').next().unwrap_or("");
    let (server, port) = server_info
        .rsplit_once(':')
        .ok_or(ParseError::MissingField("ss", "port"))?;
    if server.is_empty() {
        return Err(ParseError::MissingField("ss", "server"));
    }
    let port =
        parse_port(port.trim_end_matches('/')).ok_or(ParseError::MissingField("ss", "port"))?;

    Ok(ProxyNode {
        name: percent_decode(name),
        server: server.to_string(),
        port,
        opts: ProtocolOptions::Shadowsocks { cipher, password },
        tls: None,
        transport: None,
        alpn: vec![],
    })
}

fn serialize_ss(node: &ProxyNode) -> String {
    let (cipher, password) = match &node.opts {
        ProtocolOptions::Shadowsocks { cipher, password } => (cipher, password),
        _ => unreachable!(),
    };
    format!(
        "ss://{}@{}:{}#{}",
        b64_encode_safe(&format!("{cipher}:{password}")),
        node.server,
        node.port,
        quote(&node.name)
    )
}

// ---------------------------------------------------------------- shadowsocksR

fn parse_ssr(payload: &str) -> Result<ProxyNode, ParseError> {
    let not_a_node = || ParseError::NotANode(format!("ssr://{payload}"));
    let text = if payload.contains('?') {
        payload.to_string()
    } else {
        b64_decode(payload).ok_or_else(not_a_node)?
    };

    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() < 6 {
        return Err(not_a_node());
    }
    let (password_b64, info) = parts[parts.len() - 1]
        .split_once("/?")
        .ok_or_else(not_a_node)?;
    let password = b64_decode(password_b64).ok_or_else(not_a_node)?;
    let port = parse_port(parts[1]).ok_or(ParseError::MissingField("ssr", "port"))?;

    let mut name = String::new();
    let mut obfs_param = None;
    let mut protocol_param = None;
    let mut group = None;
    for kv in info.split('&') {
        let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
        // 参数值全部再套一层 base64
        let decoded = || b64_decode(v).unwrap_or_else(|| v.to_string());
        match k {
            "remarks" => name = decoded(),
            "group" => group = Some(decoded()),
            "obfsparam" => obfs_param = Some(decoded()),
            "protoparam" => protocol_param = Some(decoded()),
            _ => {}
        }
    }

    Ok(ProxyNode {
        name,
        server: parts[0].to_string(),
        port,
        opts: ProtocolOptions::ShadowsocksR {
            protocol: parts[2].to_string(),
            cipher: parts[3].to_string(),
            obfs: parts[4].to_string(),
            password,
            obfs_param,
            protocol_param,
            group,
        },
        tls: None,
        transport: None,
        alpn: vec![],
    })
}

fn serialize_ssr(node: &ProxyNode) -> String {
    let (protocol, cipher, obfs, password, obfs_param, protocol_param, group) = match &node.opts {
        ProtocolOptions::ShadowsocksR {
            protocol,
            cipher,
            obfs,
            password,
            obfs_param,
            protocol_param,
            group,
        } => (
            protocol,
            cipher,
            obfs,
            password,
            obfs_param,
            protocol_param,
            group,
        ),
        _ => unreachable!(),
    };
    let mut ret = format!(
        "{}:{}:{}:{}:{}:{}/?remarks={}",
        node.server,
        node.port,
        protocol,
        cipher,
        obfs,
        b64_encode_safe(password),
        b64_encode_safe(&node.name),
    );
    for (key, val) in [
        ("obfsparam", obfs_param),
        ("protoparam", protocol_param),
        ("group", group),
    ] {
        if let Some(v) = val {
            ret.push_str(&format!("&{key}={}", b64_encode_safe(v)));
        }
    }
    format!("ssr://{ret}")
}

// ---------------------------------------------------------------- trojan / vless

struct UriQuery {
    skip_cert_verify: Option<bool>,
    sni: Option<String>,
    alpn: Vec<String>,
    network: Option<String>,
    ws_path: Option<String>,
    ws_host: Option<String>,
    grpc_service: Option<String>,
    flow: Option<String>,
    fingerprint: Option<String>,
    tls_enabled: bool,
    reality_pbk: Option<String>,
    reality_sid: Option<String>,
}

fn parse_uri_query(query: &str) -> UriQuery {
    let mut q = UriQuery {
        skip_cert_verify: None,
        sni: None,
        alpn: vec![],
        network: None,
        ws_path: None,
        ws_host: None,
        grpc_service: None,
        flow: None,
        fingerprint: None,
        tls_enabled: false,
        reality_pbk: None,
        reality_sid: None,
    };
    for kv in query.split('&') {
        let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
        let v = percent_decode(v);
        match k {
            "allowInsecure" | "insecure" => q.skip_cert_verify = Some(v != "0"),
            "sni" => q.sni = Some(v),
            "alpn" => {
                q.alpn = v
                    .split(',')
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            "type" => q.network = Some(v),
            "serviceName" => q.grpc_service = Some(v),
            "host" => q.ws_host = Some(v),
            "path" => q.ws_path = Some(v),
            // 尾缀 -udp443 原样保留，其余补 `!` 标记 no-udp443，
            // 这是上游查询参数约定含混留下的补偿手段
            "flow" => {
                q.flow = Some(if v.ends_with("-udp443") {
                    v
                } else {
                    format!("{v}!")
                })
            }
            "fp" => q.fingerprint = Some(v),
            "security" if v == "tls" => q.tls_enabled = true,
            "pbk" => q.reality_pbk = Some(v),
            "sid" => q.reality_sid = Some(v),
            _ => {}
        }
    }
    q
}

fn query_transport(q: &UriQuery) -> Option<Transport> {
    match q.network.as_deref() {
        Some("ws") => Some(Transport::Ws {
            path: q.ws_path.clone(),
            host: q.ws_host.clone(),
        }),
        Some("grpc") => Some(Transport::Grpc {
            service_name: q.grpc_service.clone().unwrap_or_default(),
        }),
        _ => None,
    }
}

fn parse_trojan(uri: &str) -> Result<ProxyNode, ParseError> {
    let parsed = Url::parse(uri).map_err(|_| ParseError::NotANode(uri.to_string()))?;
    let password = percent_decode(parsed.username());
    if password.is_empty() {
        return Err(ParseError::MissingField("trojan", "password"));
    }
    let server = parsed
        .host_str()
        .ok_or(ParseError::MissingField("trojan", "server"))?
        .to_string();
    let port = parsed
        .port()
        .ok_or(ParseError::MissingField("trojan", "port"))?;

    let q = parse_uri_query(parsed.query().unwrap_or(""));
    let tls = (q.sni.is_some() || q.skip_cert_verify.is_some()).then(|| TlsOptions {
        sni: q.sni.clone(),
        skip_cert_verify: q.skip_cert_verify,
        ..Default::default()
    });

    Ok(ProxyNode {
        name: percent_decode(parsed.fragment().unwrap_or("")),
        server,
        port,
        opts: ProtocolOptions::Trojan { password },
        tls,
        transport: query_transport(&q),
        alpn: q.alpn,
    })
}

fn serialize_trojan(node: &ProxyNode) -> String {
    let password = match &node.opts {
        ProtocolOptions::Trojan { password } => password,
        _ => unreachable!(),
    };
    let mut ret = format!(
        "trojan://{}@{}:{}?",
        quote(password),
        node.server,
        node.port
    );
    push_common_query(&mut ret, node, "sni");
    push_transport_query(&mut ret, node);
    format!("{}#{}", ret.trim_end_matches('&'), quote(&node.name))
}

fn parse_vless(uri: &str) -> Result<ProxyNode, ParseError> {
    let parsed = Url::parse(uri).map_err(|_| ParseError::NotANode(uri.to_string()))?;
    let uuid = percent_decode(parsed.username());
    if uuid.is_empty() {
        return Err(ParseError::MissingField("vless", "uuid"));
    }
    let server = parsed
        .host_str()
        .ok_or(ParseError::MissingField("vless", "server"))?
        .to_string();
    let port = parsed
        .port()
        .ok_or(ParseError::MissingField("vless", "port"))?;

    let q = parse_uri_query(parsed.query().unwrap_or(""));
    let reality = q.reality_pbk.clone().map(|public_key| RealityOptions {
        public_key,
        short_id: q.reality_sid.clone().unwrap_or_default(),
    });
    let tls = (q.tls_enabled
        || q.sni.is_some()
        || q.skip_cert_verify.is_some()
        || q.fingerprint.is_some()
        || reality.is_some())
    .then(|| TlsOptions {
        enabled: q.tls_enabled,
        sni: q.sni.clone(),
        fingerprint: q.fingerprint.clone(),
        skip_cert_verify: q.skip_cert_verify,
        reality,
    });

    Ok(ProxyNode {
        name: percent_decode(parsed.fragment().unwrap_or("")),
        server,
        port,
        opts: ProtocolOptions::Vless {
            uuid,
            flow: q.flow.clone(),
        },
        tls,
        transport: query_transport(&q),
        alpn: q.alpn,
    })
}

fn serialize_vless(node: &ProxyNode) -> String {
    let (uuid, flow) = match &node.opts {
        ProtocolOptions::Vless { uuid, flow } => (uuid, flow),
        _ => unreachable!(),
    };
    let mut ret = format!("vless://{}@{}:{}?", quote(uuid), node.server, node.port);
    push_common_query(&mut ret, node, "sni");
    push_transport_query(&mut ret, node);
    if let Some(flow) = flow {
        match flow.strip_suffix('!') {
            Some(base) => ret.push_str(&format!("flow={base}&")),
            None => ret.push_str(&format!("flow={flow}&")),
        }
    }
    if let Some(tls) = &node.tls {
        if let Some(fp) = &tls.fingerprint {
            ret.push_str(&format!("fp={fp}&"));
        }
        if tls.enabled {
            ret.push_str("security=tls&");
        } else if let Some(reality) = &tls.reality {
            ret.push_str(&format!(
                "security=reality&pbk={}&sid={}&",
                reality.public_key, reality.short_id
            ));
        }
    }
    format!("{}#{}", ret.trim_end_matches('&'), quote(&node.name))
}

fn push_common_query(ret: &mut String, node: &ProxyNode, sni_key: &str) {
    if let Some(tls) = &node.tls {
        if let Some(skip) = tls.skip_cert_verify {
            ret.push_str(&format!("allowInsecure={}&", skip as u8));
        }
        if let Some(sni) = &tls.sni {
            ret.push_str(&format!("{sni_key}={sni}&"));
        }
    }
    if !node.alpn.is_empty() {
        ret.push_str(&format!("alpn={}&", quote(&node.alpn.join(","))));
    }
}

fn push_transport_query(ret: &mut String, node: &ProxyNode) {
    match &node.transport {
        Some(Transport::Grpc { service_name }) => {
            ret.push_str(&format!("type=grpc&serviceName={service_name}&"));
        }
        Some(Transport::Ws { path, host }) => {
            ret.push_str("type=ws&");
            if let Some(host) = host {
                ret.push_str(&format!("host={host}&"));
            }
            if let Some(path) = path {
                ret.push_str(&format!("path={path}&"));
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------- hysteria / hysteria2

/// 主机段可能带 "端口,跳跃范围"，标准 URL 解析器吞不下，手工拆。
fn split_host_ports(payload: &str) -> (&str, &str, u16, Option<String>, &str) {
    let (body, name) = payload.split_once('#').unwrap_or((payload, ""));
    let (body, query) = body.split_once('?').unwrap_or((body, ""));
    let hostport = body.split_once('@').map_or(body, |(_, h)| h);
    let hostport = hostport.split('/').next().unwrap_or("");

    match hostport.rsplit_once(':') {
        Some((host, ports)) => match ports.split_once(',') {
            Some((first, range)) => (
                host,
                query,
                parse_port(first).unwrap_or(443),
                Some(range.to_string()),
                name,
            ),
            None => (host, query, parse_port(ports).unwrap_or(443), None, name),
        },
        None => (hostport, query, 443, None, name),
    }
}

/// 查询段的值里允许出现裸 `&`（如 obfs 密码），沿用“无 = 则并入上一个值”的
/// 容错扫描方式。
fn scan_query(query: &str, mut visit: impl FnMut(&str, &str)) {
    let mut key = String::new();
    let mut val = String::new();
    for kv in query.split('&') {
        match kv.split_once('=') {
            Some((k, v)) => {
                key = k.to_string();
                val = v.to_string();
            }
            None => {
                val.push('&');
                val.push_str(kv);
            }
        }
        if !key.is_empty() {
            visit(&key, &val);
        }
    }
}

fn parse_hysteria2(payload: &str) -> Result<ProxyNode, ParseError> {
    let (host, query, port, ports, name) = split_host_ports(payload);
    if host.is_empty() {
        return Err(ParseError::MissingField("hysteria2", "server"));
    }
    let body = payload.split(['?', '#']).next().unwrap_or("");
    let password = body
        .split_once('@')
        .map(|(user, _)| percent_decode(user.split(':').next().unwrap_or("")))
        .filter(|p| !p.is_empty())
        .ok_or(ParseError::MissingField("hysteria2", "password"))?;

    let mut skip = None;
    let mut sni = None;
    let mut alpn = vec![];
    let mut obfs = None;
    let mut obfs_password = None;
    let mut fingerprint = None;
    scan_query(query, |k, v| match k {
        "insecure" => skip = Some(v != "0"),
        "alpn" => {
            alpn = percent_decode(v)
                .split(',')
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()
        }
        "sni" => sni = Some(v.to_string()),
        "obfs" => obfs = Some(v.to_string()),
        "obfs-password" => obfs_password = Some(v.to_string()),
        "fp" => fingerprint = Some(v.to_string()),
        _ => {}
    });

    let tls = (skip.is_some() || sni.is_some() || fingerprint.is_some()).then(|| TlsOptions {
        sni,
        fingerprint,
        skip_cert_verify: skip,
        ..Default::default()
    });

    Ok(ProxyNode {
        name: percent_decode(name),
        server: host.to_string(),
        port,
        opts: ProtocolOptions::Hysteria2 {
            password,
            obfs,
            obfs_password,
            ports,
        },
        tls,
        transport: None,
        alpn,
    })
}

fn serialize_hysteria2(node: &ProxyNode) -> String {
    let (password, obfs, obfs_password, ports) = match &node.opts {
        ProtocolOptions::Hysteria2 {
            password,
            obfs,
            obfs_password,
            ports,
        } => (password, obfs, obfs_password, ports),
        _ => unreachable!(),
    };
    let mut ret = format!(
        "hysteria2://{}@{}:{}",
        quote(password),
        node.server,
        node.port
    );
    if let Some(ports) = ports {
        ret.push_str(&format!(",{ports}"));
    }
    ret.push('?');
    if let Some(tls) = &node.tls {
        if let Some(skip) = tls.skip_cert_verify {
            ret.push_str(&format!("insecure={}&", skip as u8));
        }
    }
    if !node.alpn.is_empty() {
        ret.push_str(&format!("alpn={}&", quote(&node.alpn.join(","))));
    }
    if let Some(tls) = &node.tls {
        if let Some(fp) = &tls.fingerprint {
            ret.push_str(&format!("fp={fp}&"));
        }
        if let Some(sni) = &tls.sni {
            ret.push_str(&format!("sni={sni}&"));
        }
    }
    if let Some(obfs) = obfs {
        ret.push_str(&format!("obfs={obfs}&"));
    }
    if let Some(pw) = obfs_password {
        ret.push_str(&format!("obfs-password={pw}&"));
    }
    format!("{}#{}", ret.trim_end_matches('&'), quote(&node.name))
}

fn parse_hysteria(payload: &str) -> Result<ProxyNode, ParseError> {
    let (host, query, port, mut ports, name) = split_host_ports(payload);
    if host.is_empty() {
        return Err(ParseError::MissingField("hysteria", "server"));
    }

    let mut skip = None;
    let mut sni = None;
    let mut alpn = vec![];
    let mut auth = None;
    let mut up = None;
    let mut down = None;
    let mut obfs = None;
    let mut fast_open = false;
    let mut fingerprint = None;
    scan_query(query, |k, v| match k {
        "insecure" => skip = Some(v != "0"),
        "peer" => sni = Some(v.to_string()),
        "auth" => auth = Some(v.to_string()),
        "upmbps" => up = Some(v.to_string()),
        "downmbps" => down = Some(v.to_string()),
        "fast_open" => fast_open = v != "0",
        "alpn" => {
            alpn = percent_decode(v)
                .split(',')
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()
        }
        "obfs" | "obfsParam" => obfs = Some(v.to_string()),
        "mport" => ports = Some(v.to_string()),
        "fp" => fingerprint = Some(v.to_string()),
        _ => {}
    });

    let tls = (skip.is_some() || sni.is_some() || fingerprint.is_some()).then(|| TlsOptions {
        sni,
        fingerprint,
        skip_cert_verify: skip,
        ..Default::default()
    });

    Ok(ProxyNode {
        name: percent_decode(name),
        server: host.to_string(),
        port,
        opts: ProtocolOptions::Hysteria {
            auth,
            up,
            down,
            obfs,
            ports,
            fast_open,
        },
        tls,
        transport: None,
        alpn,
    })
}

fn serialize_hysteria(node: &ProxyNode) -> String {
    let (auth, up, down, obfs, ports, fast_open) = match &node.opts {
        ProtocolOptions::Hysteria {
            auth,
            up,
            down,
            obfs,
            ports,
            fast_open,
        } => (auth, up, down, obfs, ports, fast_open),
        _ => unreachable!(),
    };
    let mut ret = format!("hysteria://{}:{}?", node.server, node.port);
    if let Some(up) = up {
        ret.push_str(&format!("upmbps={up}&"));
    }
    if let Some(down) = down {
        ret.push_str(&format!("downmbps={down}&"));
    }
    if let Some(tls) = &node.tls {
        if let Some(skip) = tls.skip_cert_verify {
            ret.push_str(&format!("insecure={}&", skip as u8));
        }
        if let Some(sni) = &tls.sni {
            ret.push_str(&format!("peer={sni}&"));
        }
    }
    if let Some(auth) = auth {
        ret.push_str(&format!("auth={auth}&"));
    }
    if *fast_open {
        ret.push_str("fast_open=1&");
    }
    if let Some(obfs) = obfs {
        ret.push_str(&format!("obfs={obfs}&"));
    }
    if !node.alpn.is_empty() {
        ret.push_str(&format!("alpn={}&", quote(&node.alpn.join(","))));
    }
    if let Some(ports) = ports {
        ret.push_str(&format!("mport={ports}&"));
    }
    if let Some(tls) = &node.tls {
        if let Some(fp) = &tls.fingerprint {
            ret.push_str(&format!("fp={fp}&"));
        }
    }
    format!("{}#{}", ret.trim_end_matches('&'), quote(&node.name))
}

// ---------------------------------------------------------------- http / socks5

fn parse_http(uri: &str, https: bool) -> Result<ProxyNode, ParseError> {
    let parsed = Url::parse(uri).map_err(|_| ParseError::NotANode(uri.to_string()))?;
    let server = parsed
        .host_str()
        .ok_or(ParseError::MissingField("http", "server"))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or(ParseError::MissingField("http", "port"))?;

    let mut tls_enabled = https;
    let skip = https.then_some(false);
    if let Some(query) = parsed.query() {
        for kv in query.split('&') {
            let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
            if k == "tls" {
                tls_enabled = v != "0";
            }
        }
    }

    let mut name = percent_decode(parsed.fragment().unwrap_or(""));
    if name.is_empty() {
        name = uri.to_string();
    }

    let username = Some(percent_decode(parsed.username())).filter(|u| !u.is_empty());
    let password = parsed.password().map(percent_decode);
    let tls = (tls_enabled || skip.is_some()).then(|| TlsOptions {
        enabled: tls_enabled,
        skip_cert_verify: skip,
        ..Default::default()
    });

    Ok(ProxyNode {
        name,
        server,
        port,
        opts: ProtocolOptions::Http { username, password },
        tls,
        transport: None,
        alpn: vec![],
    })
}

fn serialize_http(node: &ProxyNode) -> String {
    let (username, password) = match &node.opts {
        ProtocolOptions::Http { username, password } => (username, password),
        _ => unreachable!(),
    };
    let userinfo = match (username, password) {
        (Some(u), Some(p)) => format!("{}:{}@", quote(u), quote(p)),
        (Some(u), None) => format!("{}@", quote(u)),
        _ => String::new(),
    };
    let tls = node.tls.as_ref().map(|t| t.enabled).unwrap_or(false);
    format!(
        "http://{}{}:{}?tls={}#{}",
        userinfo,
        node.server,
        node.port,
        tls as u8,
        quote(&node.name)
    )
}

fn parse_socks5(uri: &str) -> Result<ProxyNode, ParseError> {
    let parsed = Url::parse(uri).map_err(|_| ParseError::NotANode(uri.to_string()))?;
    let server = parsed
        .host_str()
        .ok_or(ParseError::MissingField("socks5", "server"))?
        .to_string();
    let port = parsed
        .port()
        .ok_or(ParseError::MissingField("socks5", "port"))?;

    let mut name = percent_decode(parsed.fragment().unwrap_or(""));
    if name.is_empty() {
        name = uri.to_string();
    }

    Ok(ProxyNode {
        name,
        server,
        port,
        opts: ProtocolOptions::Socks5 {
            username: Some(percent_decode(parsed.username())).filter(|u| !u.is_empty()),
            password: parsed.password().map(percent_decode),
        },
        tls: None,
        transport: None,
        alpn: vec![],
    })
}

fn serialize_socks5(node: &ProxyNode) -> String {
    let (username, password) = match &node.opts {
        ProtocolOptions::Socks5 { username, password } => (username, password),
        _ => unreachable!(),
    };
    let userinfo = match (username, password) {
        (Some(u), Some(p)) => format!("{}:{}@", quote(u), quote(p)),
        (Some(u), None) => format!("{}@", quote(u)),
        _ => String::new(),
    };
    format!(
        "socks5://{}{}:{}#{}",
        userinfo,
        node.server,
        node.port,
        quote(&node.name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::utils::b64_encode;

    #[test]
    fn vmess_ws_scenario() {
        let payload = r#"{"add":"example.com","port":"443","id":"uuid","net":"ws","path":"/x","host":"h.example.com","tls":"tls"}"#;
        let node = parse(&format!("vmess://{}", b64_encode(payload))).unwrap();

        assert_eq!(node.server, "example.com");
        assert_eq!(node.port, 443);
        assert!(node.tls.as_ref().unwrap().enabled);
        assert_eq!(
            node.transport,
            Some(Transport::Ws {
                path: Some("/x".to_string()),
                host: Some("h.example.com".to_string()),
            })
        );
        match &node.opts {
            ProtocolOptions::Vmess { uuid, cipher, .. } => {
                assert_eq!(uuid, "uuid");
                assert_eq!(cipher, "auto");
            }
            other => panic!("unexpected opts: {other:?}"),
        }
    }

    #[test]
    fn trojan_ws_scenario() {
        let node =
            parse("trojan://secret@host:443?sni=foo.com&type=ws&host=bar.com&path=%2Fp#MyNode")
                .unwrap();

        assert_eq!(node.name, "MyNode");
        assert_eq!(node.server, "host");
        assert_eq!(node.port, 443);
        assert_eq!(node.sni(), Some("foo.com"));
        assert_eq!(
            node.transport,
            Some(Transport::Ws {
                path: Some("/p".to_string()),
                host: Some("bar.com".to_string()),
            })
        );
        assert!(matches!(
            &node.opts,
            ProtocolOptions::Trojan { password } if password == "secret"
        ));
    }

    #[test]
    fn ss_both_encodings_agree() {
        let full = format!(
            "ss://{}#n1",
            b64_encode_safe("aes-256-gcm:pass@h.example.com:8388")
        );
        let partial = format!(
            "ss://{}@h.example.com:8388#n1",
            b64_encode_safe("aes-256-gcm:pass")
        );
        let a = parse(&full).unwrap();
        let b = parse(&partial).unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            &a.opts,
            ProtocolOptions::Shadowsocks { cipher, password }
                if cipher == "aes-256-gcm" && password == "pass"
        ));
    }

    #[test]
    fn ss_password_with_colon_splits_on_first() {
        let uri = format!("ss://{}@h.com:8388#n", b64_encode_safe("rc4-md5:pa:ss"));
        let node = parse(&uri).unwrap();
        assert!(matches!(
            &node.opts,
            ProtocolOptions::Shadowsocks { cipher, password }
                if cipher == "rc4-md5" && password == "pa:ss"
        ));
    }

    #[test]
    fn hy2_alias_and_garbage_scheme() {
        let node = parse("🚀hy2://pw@h.example.com:8443#n").unwrap();
        assert_eq!(node.kind(), "hysteria2");
        assert_eq!(node.port, 8443);
    }

    #[test]
    fn hysteria2_port_defaults_and_range() {
        let node = parse("hysteria2://pw@h.example.com#n").unwrap();
        assert_eq!(node.port, 443);

        let node = parse("hysteria2://pw@h.example.com:443,30000-40000?insecure=1#n").unwrap();
        assert_eq!(node.port, 443);
        assert!(matches!(
            &node.opts,
            ProtocolOptions::Hysteria2 { ports: Some(r), .. } if r == "30000-40000"
        ));
        assert_eq!(node.tls.as_ref().unwrap().skip_cert_verify, Some(true));

        // 端口段无法解析时回落 443
        let node = parse("hysteria2://pw@h.example.com:abc#n").unwrap();
        assert_eq!(node.port, 443);
    }

    #[test]
    fn vless_flow_marker() {
        let node = parse("vless://u@h.com:443?flow=xtls-rprx-vision#n").unwrap();
        assert!(matches!(
            &node.opts,
            ProtocolOptions::Vless { flow: Some(f), .. } if f == "xtls-rprx-vision!"
        ));
        // 序列化时剥掉标记
        assert!(serialize(&node).contains("flow=xtls-rprx-vision&"));

        let node = parse("vless://u@h.com:443?flow=xtls-rprx-vision-udp443#n").unwrap();
        assert!(matches!(
            &node.opts,
            ProtocolOptions::Vless { flow: Some(f), .. } if f == "xtls-rprx-vision-udp443"
        ));
        assert!(serialize(&node).contains("flow=xtls-rprx-vision-udp443"));
    }

    #[test]
    fn error_taxonomy() {
        assert!(matches!(parse("not a uri"), Err(ParseError::NotANode(_))));
        assert!(matches!(
            parse("wireguard://x@y:1"),
            Err(ParseError::Unsupported(t)) if t == "wireguard"
        ));
        let payload = b64_encode(r#"{"add":"example.com","port":"443"}"#);
        assert!(matches!(
            parse(&format!("vmess://{payload}")),
            Err(ParseError::MissingField("vmess", "id"))
        ));
        assert!(matches!(
            parse("trojan://@host:443#n"),
            Err(ParseError::MissingField("trojan", "password"))
        ));
    }

    fn assert_roundtrip(node: ProxyNode) {
        let uri = serialize(&node);
        let back = parse(&uri).unwrap_or_else(|e| panic!("reparse of {uri} failed: {e}"));
        assert_eq!(back, node, "roundtrip through {uri}");
    }

    #[test]
    fn roundtrip_every_protocol() {
        assert_roundtrip(ProxyNode {
            name: "节点 A".to_string(),
            server: "v.example.com".to_string(),
            port: 443,
            opts: ProtocolOptions::Vmess {
                uuid: "8f41a2e0".to_string(),
                alter_id: 2,
                cipher: "auto".to_string(),
            },
            tls: Some(TlsOptions {
                enabled: true,
                ..Default::default()
            }),
            transport: Some(Transport::Ws {
                path: Some("/ws".to_string()),
                host: Some("cdn.example.com".to_string()),
            }),
            alpn: vec![],
        });

        assert_roundtrip(ProxyNode {
            name: "h2 节点".to_string(),
            server: "v.example.com".to_string(),
            port: 8443,
            opts: ProtocolOptions::Vmess {
                uuid: "8f41a2e0".to_string(),
                alter_id: 0,
                cipher: "aes-128-gcm".to_string(),
            },
            tls: None,
            transport: Some(Transport::H2 {
                path: Some("/h2".to_string()),
                hosts: vec!["a.example.com".to_string(), "b.example.com".to_string()],
            }),
            alpn: vec![],
        });

        assert_roundtrip(ProxyNode {
            name: "trojan 节点".to_string(),
            server: "t.example.com".to_string(),
            port: 443,
            opts: ProtocolOptions::Trojan {
                password: "secret".to_string(),
            },
            tls: Some(TlsOptions {
                sni: Some("sni.example.com".to_string()),
                skip_cert_verify: Some(true),
                ..Default::default()
            }),
            transport: Some(Transport::Grpc {
                service_name: "svc".to_string(),
            }),
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
        });

        assert_roundtrip(ProxyNode {
            name: "vless reality".to_string(),
            server: "r.example.com".to_string(),
            port: 443,
            opts: ProtocolOptions::Vless {
                uuid: "u-1".to_string(),
                flow: Some("xtls-rprx-vision!".to_string()),
            },
            tls: Some(TlsOptions {
                enabled: false,
                sni: Some("sni.example.com".to_string()),
                fingerprint: Some("chrome".to_string()),
                skip_cert_verify: None,
                reality: Some(RealityOptions {
                    public_key: "pbk1".to_string(),
                    short_id: "sid1".to_string(),
                }),
            }),
            transport: Some(Transport::Ws {
                path: Some("/w".to_string()),
                host: Some("ws.example.com".to_string()),
            }),
            alpn: vec![],
        });

        assert_roundtrip(ProxyNode {
            name: "ss".to_string(),
            server: "s.example.com".to_string(),
            port: 8388,
            opts: ProtocolOptions::Shadowsocks {
                cipher: "chacha20-ietf-poly1305".to_string(),
                password: "pw:with:colons".to_string(),
            },
            tls: None,
            transport: None,
            alpn: vec![],
        });

        assert_roundtrip(ProxyNode {
            name: "ssr 节点".to_string(),
            server: "r.example.com".to_string(),
            port: 8080,
            opts: ProtocolOptions::ShadowsocksR {
                protocol: "auth_aes128_md5".to_string(),
                cipher: "aes-256-cfb".to_string(),
                obfs: "tls1.2_ticket_auth".to_string(),
                password: "密码".to_string(),
                obfs_param: Some("obfs.example.com".to_string()),
                protocol_param: Some("32".to_string()),
                group: Some("g".to_string()),
            },
            tls: None,
            transport: None,
            alpn: vec![],
        });

        assert_roundtrip(ProxyNode {
            name: "hy1".to_string(),
            server: "h.example.com".to_string(),
            port: 36712,
            opts: ProtocolOptions::Hysteria {
                auth: Some("tok".to_string()),
                up: Some("100".to_string()),
                down: Some("100".to_string()),
                obfs: Some("xplus".to_string()),
                ports: Some("30000-40000".to_string()),
                fast_open: true,
            },
            tls: Some(TlsOptions {
                sni: Some("sni.example.com".to_string()),
                skip_cert_verify: Some(true),
                ..Default::default()
            }),
            transport: None,
            alpn: vec!["hysteria".to_string()],
        });

        assert_roundtrip(ProxyNode {
            name: "hy2".to_string(),
            server: "h2.example.com".to_string(),
            port: 443,
            opts: ProtocolOptions::Hysteria2 {
                password: "pw".to_string(),
                obfs: Some("salamander".to_string()),
                obfs_password: Some("op".to_string()),
                ports: Some("20000-30000".to_string()),
            },
            tls: Some(TlsOptions {
                sni: Some("sni.example.com".to_string()),
                fingerprint: Some("chrome".to_string()),
                skip_cert_verify: Some(false),
                ..Default::default()
            }),
            transport: None,
            alpn: vec!["h3".to_string()],
        });

        assert_roundtrip(ProxyNode {
            name: "http 节点".to_string(),
            server: "p.example.com".to_string(),
            port: 8080,
            opts: ProtocolOptions::Http {
                username: None,
                password: None,
            },
            tls: None,
            transport: None,
            alpn: vec![],
        });

        assert_roundtrip(ProxyNode {
            name: "socks".to_string(),
            server: "s5.example.com".to_string(),
            port: 1080,
            opts: ProtocolOptions::Socks5 {
                username: Some("u".to_string()),
                password: Some("p".to_string()),
            },
            tls: None,
            transport: None,
            alpn: vec![],
        });
    }

    #[test]
    fn https_scheme_forces_tls() {
        let node = parse("https://p.example.com:8443#n").unwrap();
        assert_eq!(node.kind(), "http");
        let tls = node.tls.as_ref().unwrap();
        assert!(tls.enabled);
        assert_eq!(tls.skip_cert_verify, Some(false));
    }

    #[test]
    fn unnamed_default() {
        let node = parse("trojan://secret@host:443").unwrap();
        assert_eq!(node.name, "unnamed");
    }
}
