//! The wire frame: UTF-8, newline-delimited, `COMMAND[ ARG1 ARG2 …]`.
//! Binary payloads (block/transaction bytes, hashes) are hex-encoded into
//! individual args rather than packed into a single binary blob — this
//! keeps framing trivial (split on whitespace, no length prefixes) at the
//! cost of being less compact than a binary protocol, which is an
//! acceptable trade for a node that never has to interop with anything but
//! its own peers.

use smellycoin_core::Hash;

pub const GET_ADDR: &str = "GET_ADDR";
pub const ADDR: &str = "ADDR";
pub const VERSION: &str = "VERSION";
pub const VERSION_ACK: &str = "VERSION_ACK";
pub const GET_BLOCKS: &str = "GET_BLOCKS";
pub const INV: &str = "INV";
pub const GET_DATA: &str = "GET_DATA";
pub const DATA: &str = "DATA";

/// The protocol-version token carried by `VERSION` frames (base spec §9's
/// "small protocol-versioning field" recommendation). Bumped if the frame
/// shapes below ever change incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// A single parsed line of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub args: Vec<String>,
}

impl Frame {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Frame { command: command.into(), args }
    }

    /// Parse one line (without its trailing newline). Returns `None` for a
    /// blank line; a line with no arguments yields a `Frame` with an empty
    /// `args`.
    pub fn parse(line: &str) -> Option<Frame> {
        let mut parts = line.split_whitespace();
        let command = parts.next()?.to_string();
        let args = parts.map(str::to_string).collect();
        Some(Frame { command, args })
    }

    /// Render back to a single line, without the trailing newline — callers
    /// append `"\n"` when writing to the socket.
    pub fn render(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

pub fn encode_hash(hash: &Hash) -> String {
    hex::encode(hash)
}

pub fn decode_hash(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// An entry in an `INV` / `GET_DATA` / `DATA` frame: each item is a
/// `{TX|BLOCK} <hex_payload>` pair, so a frame's args always have even
/// length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    Block,
}

impl InvKind {
    fn as_str(&self) -> &'static str {
        match self {
            InvKind::Tx => "TX",
            InvKind::Block => "BLOCK",
        }
    }

    fn parse(s: &str) -> Option<InvKind> {
        match s {
            "TX" => Some(InvKind::Tx),
            "BLOCK" => Some(InvKind::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash,
}

/// Pack `{kind} <hex>` pairs into a frame's args.
pub fn encode_inv_items(items: &[InvItem]) -> Vec<String> {
    items
        .iter()
        .flat_map(|item| [item.kind.as_str().to_string(), encode_hash(&item.hash)])
        .collect()
}

/// Parse args into `{kind} <hex>` pairs, dropping any malformed or trailing
/// unpaired entry rather than failing the whole frame.
pub fn parse_inv_items(args: &[String]) -> Vec<InvItem> {
    args.chunks_exact(2)
        .filter_map(|pair| {
            let kind = InvKind::parse(&pair[0])?;
            let hash = decode_hash(&pair[1])?;
            Some(InvItem { kind, hash })
        })
        .collect()
}

/// Pack `{kind} <hex_bytes>` pairs (the `DATA` frame shape, where the
/// payload is the object's serialized bytes rather than its hash).
pub fn encode_data_items(items: &[(InvKind, Vec<u8>)]) -> Vec<String> {
    items
        .iter()
        .flat_map(|(kind, bytes)| [kind.as_str().to_string(), hex::encode(bytes)])
        .collect()
}

pub fn parse_data_items(args: &[String]) -> Vec<(InvKind, Vec<u8>)> {
    args.chunks_exact(2)
        .filter_map(|pair| {
            let kind = InvKind::parse(&pair[0])?;
            let bytes = hex::decode(&pair[1]).ok()?;
            Some((kind, bytes))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_through_render_and_parse() {
        let frame = Frame::new(GET_BLOCKS, vec![encode_hash(&[1u8; 32]), encode_hash(&[2u8; 32])]);
        let rendered = frame.render();
        let parsed = Frame::parse(&rendered).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn parse_rejects_blank_line() {
        assert!(Frame::parse("").is_none());
        assert!(Frame::parse("   ").is_none());
    }

    #[test]
    fn inv_items_roundtrip() {
        let items = vec![
            InvItem { kind: InvKind::Tx, hash: [3u8; 32] },
            InvItem { kind: InvKind::Block, hash: [4u8; 32] },
        ];
        let args = encode_inv_items(&items);
        assert_eq!(parse_inv_items(&args), items);
    }

    #[test]
    fn parse_inv_items_drops_malformed_entries() {
        let args = vec!["TX".to_string(), "not-hex".to_string(), "BOGUS".to_string(), encode_hash(&[1u8; 32])];
        assert!(parse_inv_items(&args).is_empty());
    }
}
