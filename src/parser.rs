//! Classification-rule parser.
//!
//! One rule describes one linear classification path ending in a fresh FCB
//! carrying an output label:
//!
//! ```text
//! rule    := classes  keep?  output?
//! classes := "-"  |  class ( ("&&" | WS) class )*
//! class   := "agg" | "thread"
//!          | "ip proto" (name|number)
//!          | ("src"|"dst") ("host" IPv4 | "port" (name|num) | "net" IPv4/bits)
//!          | ["ip+"] [sign] digits "/" hex ["/" hex]     // value or value/mask
//! hint    := ":HASH-" digit | ":ARRAY"
//! prio    := "!"            // else-drop: no default route after this node
//! output  := number | "drop"
//! ```
//!
//! A class whose value masks to zero is *dynamic*: its children are
//! learned at packet time. `-` is the default rule. A missing output is
//! the sentinel [`OUTPUT_UNSET`], resolved by the dispatcher to "previous
//! output plus one".

use crate::fcb::FcbId;
use crate::level::FlowLevel;
use crate::node::{ContainerHint, EdgeTarget, FlowNode, NodeId};
use crate::tree::{SlotRef, Tree};
use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use regex::Regex;
use std::sync::OnceLock;

/// Sentinel output for rules that did not name one.
pub const OUTPUT_UNSET: i32 = i32::MAX;

/// Classification context: where the protocol-relative classes anchor.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ParseContext {
    /// Rules start at an Ethernet frame; IP-relative classes shift by 14.
    #[default]
    Ether,
    /// Rules start at the IP header.
    None,
}

impl ParseContext {
    fn ip_base(self) -> usize {
        match self {
            ParseContext::Ether => 14,
            ParseContext::None => 0,
        }
    }
}

/// A parsed rule: a single-path tree, its output label, and whether it was
/// the `-` default rule.
#[derive(Clone, Debug)]
pub struct Rule {
    /// Root of the single-path tree.
    pub root: NodeId,
    /// Leaf FCB at the end of the path.
    pub leaf: FcbId,
    /// Output label (`-1` is drop, [`OUTPUT_UNSET`] means unset).
    pub output: i32,
    /// True for the `-` rule.
    pub is_default: bool,
    /// `keep`: the rule's leaf survives overlaps without a warning.
    pub keep: bool,
}

const REG_IPV4: &str = r"[0-9]{1,3}(?:[.][0-9]{1,3}){3}";

fn rule_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let class = format!(
            r"(?:agg|thread|ip\s+proto\s+(?:[a-z]+|[0-9]+)|(?:src|dst)\s+(?:host\s+{REG_IPV4}|port\s+(?:[a-z]+|[0-9]+)|net\s+{REG_IPV4}/[0-9]+)|(?:ip\+)?-?[0-9]+/[0-9a-fA-F]*(?:/[0-9a-fA-F]+)?)(?::HASH-[0-9]+|:ARRAY)?!?"
        );
        Regex::new(&format!(
            r"(?i)^\s*((?:{class}(?:\s*&&\s*|\s+|$))+|-)(\s*keep)?(\s*(?:[0-9]+|drop))?\s*$"
        ))
        .expect("rule regex compiles")
    })
}

fn class_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)(thread|agg)|(?:ip\s+proto\s+([a-z]+|[0-9]+))|(?:(src|dst)\s+(?:host\s+({REG_IPV4})|port\s+([a-z]+|[0-9]+)|net\s+({REG_IPV4})/([0-9]+)))|(?:(ip\+)?(-?[0-9]+)/([0-9a-fA-F]*)(?:/([0-9a-fA-F]+))?)"
        ))
        .expect("class regex compiles")
    })
}

fn hint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i):(?:HASH-([0-9]+)|(ARRAY))(!)?|(!)").expect("hint regex"))
}

fn parse_port(word: &str) -> Result<u64> {
    match word.to_ascii_lowercase().as_str() {
        "ssh" => Ok(22),
        "dns" => Ok(53),
        "http" | "www" => Ok(80),
        "https" => Ok(443),
        _ => word
            .parse::<u64>()
            .with_context(|| format!("unknown port {word:?}")),
    }
}

fn parse_proto(word: &str) -> Result<u64> {
    let v = match word.to_ascii_lowercase().as_str() {
        "icmp" => 1,
        "tcp" => 6,
        "udp" => 17,
        _ => word.parse::<u64>().unwrap_or(0),
    };
    if v == 0 {
        bail!("could not parse IP protocol {word:?}");
    }
    Ok(v)
}

fn parse_ipv4(s: &str) -> Result<u64> {
    let addr: std::net::Ipv4Addr = s.parse().with_context(|| format!("bad IPv4 {s:?}"))?;
    Ok(u64::from(u32::from_be_bytes(addr.octets())))
}

/// One parsed class: the level plus the constant value (None = dynamic).
struct ParsedClass {
    level: FlowLevel,
    value: Option<u64>,
    hint: Option<ContainerHint>,
    else_drop: bool,
}

fn parse_class(text: &str, ctx: ParseContext) -> Result<ParsedClass> {
    let caps = class_regex()
        .captures(text)
        .ok_or_else(|| anyhow!("{text:?} is not a valid class"))?;

    let mut hint = None;
    let mut else_drop = false;
    if let Some(rest) = text.get(caps.get(0).expect("match").end()..) {
        for h in hint_regex().captures_iter(rest) {
            if let Some(class) = h.get(1) {
                hint = Some(ContainerHint::Hash(class.as_str().parse()?));
            } else if h.get(2).is_some() {
                hint = Some(ContainerHint::Array);
            }
            if h.get(3).is_some() || h.get(4).is_some() {
                else_drop = true;
            }
        }
    }

    let (level, value) = if let Some(named) = caps.get(1) {
        match named.as_str().to_ascii_lowercase().as_str() {
            "agg" => (FlowLevel::Aggregate, None),
            _ => (
                FlowLevel::Thread {
                    max_cpus: num_cpus::get(),
                },
                None,
            ),
        }
    } else if let Some(proto) = caps.get(2) {
        let value = parse_proto(proto.as_str())?;
        (FlowLevel::generic(ctx.ip_base() + 9, 0xFF), Some(value))
    } else if let Some(side) = caps.get(3) {
        let src = side.as_str().eq_ignore_ascii_case("src");
        if let Some(host) = caps.get(4) {
            let offset = ctx.ip_base() + if src { 12 } else { 16 };
            (
                FlowLevel::generic(offset, 0xFFFF_FFFF),
                Some(parse_ipv4(host.as_str())?),
            )
        } else if let Some(port) = caps.get(5) {
            let offset = ctx.ip_base() + if src { 20 } else { 22 };
            (FlowLevel::generic(offset, 0xFFFF), Some(parse_port(port.as_str())?))
        } else {
            let net = parse_ipv4(caps.get(6).expect("net address").as_str())?;
            let bits: u32 = caps.get(7).expect("prefix length").as_str().parse()?;
            if bits > 32 {
                bail!("prefix length /{bits} out of range");
            }
            let mask = if bits == 0 {
                0
            } else {
                (u64::from(u32::MAX) >> (32 - bits)) << (32 - bits)
            };
            let offset = ctx.ip_base() + if src { 12 } else { 16 };
            (FlowLevel::generic(offset, mask), Some(net & mask))
        }
    } else {
        let ip_rel = caps.get(8).is_some();
        let signed_offset: i64 = caps.get(9).expect("offset").as_str().parse()?;
        let value_text = caps.get(10).map_or("", |m| m.as_str());
        let value = if value_text.is_empty() {
            0
        } else {
            u64::from_str_radix(value_text, 16)
                .with_context(|| format!("bad hex value {value_text:?}"))?
        };
        let mask = match caps.get(11) {
            Some(m) => u64::from_str_radix(m.as_str(), 16)
                .with_context(|| format!("bad hex mask {:?}", m.as_str()))?,
            None if value_text.is_empty() => bail!("class {text:?} has neither value nor mask"),
            None => {
                let nibbles = value_text.len().min(16);
                if nibbles == 16 {
                    u64::MAX
                } else {
                    (1u64 << (nibbles * 4)) - 1
                }
            }
        };
        let base = if ip_rel { ctx.ip_base() as i64 } else { 0 };
        let offset = base + signed_offset;
        if offset < 0 {
            bail!("negative absolute offset in class {text:?}");
        }
        if mask & value == 0 {
            // Mask-only: the matched values are learned at runtime.
            (FlowLevel::generic_dynamic(offset as usize, mask), None)
        } else {
            (FlowLevel::generic(offset as usize, mask), Some(value & mask))
        }
    };

    Ok(ParsedClass {
        level,
        value,
        hint,
        else_drop,
    })
}

/// Parse one rule into a single-path tree inside `tree`.
///
/// `owner` names the element the rule belongs to; it is carried onto nodes
/// and the leaf for conflict reporting.
///
/// # Errors
///
/// Any malformed input fails the parse; rules are only parsed during
/// build, before any packet flows.
pub fn parse(tree: &mut Tree, owner: &str, rule: &str, ctx: ParseContext) -> Result<Rule> {
    let caps = rule_regex()
        .captures(rule)
        .ok_or_else(|| anyhow!("{rule:?} is not a valid rule"))?;
    let classes = caps.get(1).expect("classes group").as_str().trim();
    let keep = caps.get(2).is_some();
    let output = match caps.get(3).map(|m| m.as_str().trim()) {
        Some(w) if w.eq_ignore_ascii_case("drop") => -1,
        Some(num) => num.parse::<i32>()?,
        None => OUTPUT_UNSET,
    };

    let mut root: Option<NodeId> = None;
    let mut attach: Option<(NodeId, SlotRef)> = None;
    let mut is_default = false;
    let mut last_value = 0u64;

    if classes == "-" {
        debug!("rule {rule:?}: default rule");
        let mut node = FlowNode::dummy();
        node.owner = Some(owner.to_string());
        let id = tree.alloc(node);
        root = Some(id);
        attach = Some((id, SlotRef::Default));
        is_default = true;
    } else {
        for m in class_regex().find_iter(classes) {
            // Feed the class plus its trailing hint markers.
            let end = classes[m.end()..]
                .find(|c: char| c.is_whitespace() || c == '&')
                .map_or(classes.len(), |i| m.end() + i);
            let parsed = parse_class(&classes[m.start()..end], ctx)?;
            debug!(
                "rule {rule:?}: class level {} value {:?}",
                parsed.level, parsed.value
            );

            let mut node = FlowNode::new(parsed.level.clone());
            node.owner = Some(owner.to_string());
            node.hint = parsed.hint;
            node.else_drop = parsed.else_drop;
            if parsed.value.is_none() {
                node.level.set_dynamic();
            }
            let id = tree.alloc(node);

            if let Some((parent, slot)) = attach {
                tree.set_edge(parent, slot, EdgeTarget::Node(id));
            } else {
                root = Some(id);
            }

            match parsed.value {
                Some(v) => {
                    last_value = v;
                    attach = Some((id, SlotRef::Keyed(v)));
                }
                None => {
                    last_value = u64::MAX;
                    attach = Some((id, SlotRef::Default));
                }
            }
        }
    }

    let root = root.ok_or_else(|| anyhow!("{rule:?} contains no class"))?;
    let (parent, slot) = attach.expect("at least one attach point");

    let leaf = tree.pool.init_allocate();
    {
        let fcb = tree.pool.get_mut(leaf);
        fcb.origin = Some(owner.to_string());
        fcb.node_data = last_value;
        fcb.keep = keep;
        fcb.acquire(1);
    }
    tree.set_edge(parent, slot, EdgeTarget::Leaf(leaf));
    tree.check(root);

    Ok(Rule {
        root,
        leaf,
        output,
        is_default,
        keep,
    })
}

/// The implicit trailing rule: match everything, drop it.
pub fn make_drop_rule(tree: &mut Tree, owner: &str) -> Rule {
    let mut rule = parse(tree, owner, "- drop", ParseContext::None).expect("builtin rule parses");
    rule.output = -1;
    tree.pool.get_mut(rule.leaf).set_early_drop(true);
    rule
}

/// Print the single-path rule at `root` back into rule text. Only defined
/// for trees that are a single path (each node has at most one child edge).
#[must_use]
pub fn unparse(tree: &Tree, root: NodeId) -> String {
    let mut parts = Vec::new();
    let mut cur = Some(root);
    while let Some(id) = cur {
        let node = tree.node(id);
        let (text, next) = match (&node.level, node.edges().first().copied()) {
            (FlowLevel::Aggregate, _) => ("agg".to_string(), node.default),
            (FlowLevel::Thread { .. }, _) => ("thread".to_string(), node.default),
            (FlowLevel::Dummy, _) => ("-".to_string(), node.default),
            (FlowLevel::Generic(g), Some(edge)) => (
                format!("{}/{:x}/{:x}", g.offset, edge.data, g.mask),
                Some(edge.target),
            ),
            (FlowLevel::Generic(g), None) => {
                (format!("{}/0/{:x}", g.offset, g.mask), node.default)
            }
        };
        parts.push(text);
        cur = match next {
            Some(EdgeTarget::Node(n)) => Some(n),
            _ => None,
        };
    }
    parts.join(" && ")
}
