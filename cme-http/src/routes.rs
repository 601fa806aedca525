//! Route table for the smart and dumb HTTP protocol surface
//!
//! Patterns are tried in order, so the specific `objects/info/*` files come
//! before the catch-all.

use hyper::Method;
use regex::Regex;

use cme_core::ObjectType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
    InfoRefs,
    TextFile,
    InfoPacks,
    LooseObject,
    PackFile,
    IdxFile,
}

impl Service {
    pub fn method(self) -> Method {
        match self {
            Service::UploadPack | Service::ReceivePack => Method::POST,
            _ => Method::GET,
        }
    }

    /// Backend program name for the RPC services.
    pub fn rpc(self) -> Option<&'static str> {
        match self {
            Service::UploadPack => Some("upload-pack"),
            Service::ReceivePack => Some("receive-pack"),
            _ => None,
        }
    }
}

const PATTERNS: [(&str, Service); 11] = [
    (r"^(.*?)/git-upload-pack$", Service::UploadPack),
    (r"^(.*?)/git-receive-pack$", Service::ReceivePack),
    (r"^(.*?)/info/refs$", Service::InfoRefs),
    (r"^(.*?)/HEAD$", Service::TextFile),
    (r"^(.*?)/objects/info/alternates$", Service::TextFile),
    (r"^(.*?)/objects/info/http-alternates$", Service::TextFile),
    (r"^(.*?)/objects/info/packs$", Service::InfoPacks),
    (r"^(.*?)/objects/info/[^/]*$", Service::TextFile),
    (r"^(.*?)/objects/[0-9a-f]{2}/[0-9a-f]{38}$", Service::LooseObject),
    (r"^(.*?)/objects/pack/pack-[0-9a-f]{40}\.pack$", Service::PackFile),
    (r"^(.*?)/objects/pack/pack-[0-9a-f]{40}\.idx$", Service::IdxFile),
];

/// A path resolved against the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'p> {
    pub service: Service,
    /// Everything before the protocol file, e.g. `/device/cme/trans=abc`
    pub prefix: &'p str,
    /// Path of the protocol file relative to the git directory, e.g. `/info/refs`
    pub file: &'p str,
}

pub struct RouteTable {
    routes: Vec<(Regex, Service)>,
}

impl RouteTable {
    pub fn new() -> Result<Self, regex::Error> {
        let routes = PATTERNS
            .iter()
            .map(|(pattern, service)| Regex::new(pattern).map(|re| (re, *service)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { routes })
    }

    pub fn resolve<'p>(&self, path: &'p str) -> Option<RouteMatch<'p>> {
        self.routes.iter().find_map(|(re, service)| {
            let caps = re.captures(path)?;
            let prefix = caps.get(1)?.as_str();
            Some(RouteMatch {
                service: *service,
                prefix,
                file: &path[prefix.len()..],
            })
        })
    }
}

/// Object type and push annotations carried in a route prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub object_type: ObjectType,
    pub src_node: Option<String>,
    pub transaction: Option<String>,
}

/// `/<type>/cme[/src=<node>][/trans=<id>]`. The first segment picks the
/// repository; `None` if it names no known type.
pub fn parse_prefix(prefix: &str) -> Option<Target> {
    let mut segments = prefix.split('/').filter(|s| !s.is_empty());
    let first = segments.next()?;
    let object_type = ObjectType::ALL
        .into_iter()
        .find(|t| t.url_segment() == first)?;

    let mut target = Target {
        object_type,
        src_node: None,
        transaction: None,
    };
    for segment in segments {
        if let Some(node) = segment.strip_prefix("src=") {
            target.src_node = Some(node.to_string()).filter(|s| !s.is_empty());
        } else if let Some(id) = segment.strip_prefix("trans=") {
            target.transaction = Some(id.to_string()).filter(|s| !s.is_empty());
        }
    }
    Some(target)
}
