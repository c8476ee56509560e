//! Zone master file parsing.
//!
//! Understands the usual [RFC 1035][RFC-1035] master file syntax (`$ORIGIN`, `$TTL`, `@`,
//! relative owners, omitted owner/TTL/class, parentheses, comments, quoted strings) plus the
//! private `DYNA` record type, whose only field names a service:
//!
//! ```text
//! www  300 IN DYNA service1
//! ```
//!
//! Types without a dedicated parser may be written in the [RFC 3597][RFC-3597] generic form
//! `TYPE65280 \# 3 616263`.
//!
//! [RFC-1035]: https://www.rfc-editor.org/rfc/rfc1035#section-5
//! [RFC-3597]: https://www.rfc-editor.org/rfc/rfc3597#section-5

use crate::error::Error;
use crate::zone::records::{DNAME, DYNA};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use trust_dns_proto::rr::rdata::{MX, NULL, SOA, SRV, TXT};
use trust_dns_proto::rr::{DNSClass, Name, RData, Record, RecordType};

const DEFAULT_TTL: u32 = 3600;

/// One record read from a master file.
#[derive(Debug, Clone)]
pub enum ParsedRecord {
    /// Ordinary zone data.
    Static(Record),
    /// A DNAME record together with its decoded target.
    Dname { record: Record, target: Name },
    /// A `DYNA` placeholder naming a service.
    Dynamic {
        owner: Name,
        ttl: u32,
        class: DNSClass,
        service: String,
    },
}

impl ParsedRecord {
    #[must_use]
    pub fn owner(&self) -> &Name {
        match self {
            ParsedRecord::Static(record) | ParsedRecord::Dname { record, .. } => record.name(),
            ParsedRecord::Dynamic { owner, .. } => owner,
        }
    }
}

#[derive(Debug)]
struct Token {
    text: String,
    quoted: bool,
}

#[derive(Debug)]
struct Entry {
    line: usize,
    blank_owner: bool,
    tokens: Vec<Token>,
}

/// Parses master file `text` for the zone `origin`, returning records in file order.
///
/// # Errors
///
/// Returns [`Error::ZoneParse`] describing the first line that can't be understood.
pub fn parse(text: &str, origin: &Name) -> Result<Vec<ParsedRecord>, Error> {
    let mut origin = origin.clone();
    let mut default_ttl: Option<u32> = None;
    let mut last_ttl: Option<u32> = None;
    let mut last_owner: Option<Name> = None;
    let mut last_class = DNSClass::IN;
    let mut records = Vec::new();

    for entry in tokenize(text)? {
        let line = entry.line;
        let mut tokens = entry.tokens.iter().peekable();

        let owner = if entry.blank_owner {
            last_owner
                .clone()
                .ok_or_else(|| Error::zone_parse(line, "no previous owner name"))?
        } else {
            // NB: tokenize never yields an entry without tokens.
            let first = tokens.next().ok_or_else(|| Error::zone_parse(line, "empty"))?;
            if !first.quoted && first.text.starts_with('$') {
                let args: Vec<&Token> = tokens.collect();
                match first.text.to_ascii_uppercase().as_str() {
                    "$ORIGIN" => {
                        let arg = single(&args, line, "$ORIGIN")?;
                        origin = parse_name(arg, &origin, line)?;
                    }
                    "$TTL" => {
                        let arg = single(&args, line, "$TTL")?;
                        default_ttl = Some(
                            parse_ttl(arg)
                                .ok_or_else(|| Error::zone_parse(line, "invalid $TTL"))?,
                        );
                    }
                    other => {
                        return Err(Error::zone_parse(
                            line,
                            format!("unsupported directive {other}"),
                        ))
                    }
                }
                continue;
            }
            parse_name(&first.text, &origin, line)?
        };

        let mut ttl = None;
        let mut class = None;
        for _ in 0..2 {
            let Some(token) = tokens.peek() else { break };
            if ttl.is_none() && token.text.starts_with(|c: char| c.is_ascii_digit()) {
                ttl = Some(
                    parse_ttl(&token.text).ok_or_else(|| Error::zone_parse(line, "invalid TTL"))?,
                );
            } else if let (None, Some(parsed)) = (class, parse_class(&token.text)) {
                class = Some(parsed);
            } else {
                break;
            }
            tokens.next();
        }

        let type_token = tokens
            .next()
            .ok_or_else(|| Error::zone_parse(line, "missing record type"))?;
        let rtype_text = type_token.text.to_ascii_uppercase();
        let rdata: Vec<&Token> = tokens.collect();

        let ttl = ttl
            .or(default_ttl)
            .or(last_ttl)
            .unwrap_or(DEFAULT_TTL);
        let class = class.unwrap_or(last_class);
        last_ttl = Some(ttl);
        last_class = class;
        last_owner = Some(owner.clone());

        if rtype_text == "DYNA" {
            let service = single(&rdata, line, "DYNA")?;
            records.push(ParsedRecord::Dynamic {
                owner,
                ttl,
                class,
                service: service.to_string(),
            });
            continue;
        }

        let rtype = parse_type(&rtype_text)
            .ok_or_else(|| Error::zone_parse(line, format!("unknown record type {rtype_text}")))?;
        let (data, dname_target) = parse_rdata(rtype, &rdata, &origin, line)?;
        let mut record = Record::with(owner, rtype, ttl);
        record.set_dns_class(class);
        record.set_data(Some(data));
        records.push(match dname_target {
            Some(target) => ParsedRecord::Dname { record, target },
            None => ParsedRecord::Static(record),
        });
    }
    Ok(records)
}

fn single<'a>(args: &[&'a Token], line: usize, what: &str) -> Result<&'a str, Error> {
    match args {
        [one] => Ok(&one.text),
        _ => Err(Error::zone_parse(
            line,
            format!("{what} takes exactly one argument"),
        )),
    }
}

fn tokenize(text: &str) -> Result<Vec<Entry>, Error> {
    let mut entries = Vec::new();
    let mut current: Option<Entry> = None;
    let mut depth = 0usize;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        if current.is_none() {
            current = Some(Entry {
                line,
                blank_owner: raw.starts_with([' ', '\t']),
                tokens: Vec::new(),
            });
        }
        let entry = current.as_mut().ok_or_else(|| Error::zone_parse(line, "tokenizer"))?;

        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                ';' => break,
                ' ' | '\t' => {}
                '(' => depth += 1,
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| Error::zone_parse(line, "unbalanced ')'"))?;
                }
                '"' => {
                    let mut text = String::new();
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    text.push(escaped);
                                }
                            }
                            '"' => {
                                closed = true;
                                break;
                            }
                            _ => text.push(c),
                        }
                    }
                    if !closed {
                        return Err(Error::zone_parse(line, "unterminated quoted string"));
                    }
                    entry.tokens.push(Token { text, quoted: true });
                }
                _ => {
                    let mut text = String::from(c);
                    while let Some(&next) = chars.peek() {
                        if matches!(next, ' ' | '\t' | ';' | '(' | ')' | '"') {
                            break;
                        }
                        text.push(next);
                        chars.next();
                        if next == '\\' {
                            if let Some(escaped) = chars.next() {
                                text.push(escaped);
                            }
                        }
                    }
                    entry.tokens.push(Token {
                        text,
                        quoted: false,
                    });
                }
            }
        }

        if depth == 0 {
            if let Some(done) = current.take() {
                if !done.tokens.is_empty() {
                    entries.push(done);
                }
            }
        }
    }
    if depth != 0 {
        return Err(Error::zone_parse(
            text.lines().count(),
            "unbalanced '(' at end of file",
        ));
    }
    Ok(entries)
}

fn parse_name(text: &str, origin: &Name, line: usize) -> Result<Name, Error> {
    let invalid = |_| Error::zone_parse(line, format!("invalid name \"{text}\""));
    if text == "@" {
        return Ok(origin.clone());
    }
    let name = Name::from_ascii(text).map_err(invalid)?;
    if text.ends_with('.') {
        Ok(name)
    } else {
        name.append_domain(origin).map_err(invalid)
    }
}

/// Parses a TTL in plain seconds or BIND unit notation, e.g. `3600`, `1h`, `1d12h`.
fn parse_ttl(text: &str) -> Option<u32> {
    if let Ok(seconds) = text.parse() {
        return Some(seconds);
    }
    let mut total: u32 = 0;
    let mut value: Option<u32> = None;
    for c in text.chars() {
        if let Some(digit) = c.to_digit(10) {
            value = Some(value.unwrap_or(0).checked_mul(10)?.checked_add(digit)?);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return None,
        };
        total = total.checked_add(value.take()?.checked_mul(unit)?)?;
    }
    match value {
        Some(_) => None,
        None => Some(total),
    }
}

fn parse_class(text: &str) -> Option<DNSClass> {
    match text.to_ascii_uppercase().as_str() {
        "IN" => Some(DNSClass::IN),
        "CH" => Some(DNSClass::CH),
        "HS" => Some(DNSClass::HS),
        _ => None,
    }
}

fn parse_type(text: &str) -> Option<RecordType> {
    let rtype = match text {
        "A" => RecordType::A,
        "AAAA" => RecordType::AAAA,
        "NS" => RecordType::NS,
        "CNAME" => RecordType::CNAME,
        "DNAME" => DNAME,
        "PTR" => RecordType::PTR,
        "MX" => RecordType::MX,
        "TXT" => RecordType::TXT,
        "SRV" => RecordType::SRV,
        "SOA" => RecordType::SOA,
        "DS" => RecordType::DS,
        "CAA" => RecordType::CAA,
        "SSHFP" => RecordType::SSHFP,
        "TLSA" => RecordType::TLSA,
        other => {
            let code: u16 = other.strip_prefix("TYPE")?.parse().ok()?;
            if code == u16::from(DYNA) {
                return None;
            }
            RecordType::from(code)
        }
    };
    Some(rtype)
}

fn parse_rdata(
    rtype: RecordType,
    tokens: &[&Token],
    origin: &Name,
    line: usize,
) -> Result<(RData, Option<Name>), Error> {
    let text: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
    let invalid = || Error::zone_parse(line, format!("invalid {rtype} record data"));

    if text.first() == Some(&"\\#") {
        return Ok((generic(rtype, &text[1..], line)?, None));
    }

    let data = match (rtype, text.as_slice()) {
        (RecordType::A, [addr]) => RData::A(Ipv4Addr::from_str(addr).map_err(|_| invalid())?),
        (RecordType::AAAA, [addr]) => {
            RData::AAAA(Ipv6Addr::from_str(addr).map_err(|_| invalid())?)
        }
        (RecordType::NS, [target]) => RData::NS(parse_name(target, origin, line)?),
        (RecordType::CNAME, [target]) => RData::CNAME(parse_name(target, origin, line)?),
        (RecordType::PTR, [target]) => RData::PTR(parse_name(target, origin, line)?),
        (RecordType::MX, [preference, exchange]) => RData::MX(MX::new(
            preference.parse().map_err(|_| invalid())?,
            parse_name(exchange, origin, line)?,
        )),
        (RecordType::SRV, [priority, weight, port, target]) => RData::SRV(SRV::new(
            priority.parse().map_err(|_| invalid())?,
            weight.parse().map_err(|_| invalid())?,
            port.parse().map_err(|_| invalid())?,
            parse_name(target, origin, line)?,
        )),
        (RecordType::TXT, strings) if !strings.is_empty() => {
            RData::TXT(TXT::new(strings.iter().map(ToString::to_string).collect()))
        }
        (RecordType::SOA, [mname, rname, serial, refresh, retry, expire, minimum]) => {
            let seconds = |value: &str| parse_ttl(value).ok_or_else(invalid);
            let signed = |value: &str| {
                seconds(value).and_then(|s| i32::try_from(s).map_err(|_| invalid()))
            };
            RData::SOA(SOA::new(
                parse_name(mname, origin, line)?,
                parse_name(rname, origin, line)?,
                serial.parse().map_err(|_| invalid())?,
                signed(refresh)?,
                signed(retry)?,
                signed(expire)?,
                seconds(minimum)?,
            ))
        }
        (RecordType::DS, [key_tag, algorithm, digest_type, digest @ ..]) if !digest.is_empty() => {
            let mut wire = Vec::new();
            wire.extend_from_slice(
                &key_tag
                    .parse::<u16>()
                    .map_err(|_| invalid())?
                    .to_be_bytes(),
            );
            wire.push(algorithm.parse().map_err(|_| invalid())?);
            wire.push(digest_type.parse().map_err(|_| invalid())?);
            wire.extend(decode_hex(&digest.concat()).ok_or_else(invalid)?);
            unknown(rtype, wire)
        }
        (rtype, [target]) if rtype == DNAME => {
            let target = parse_name(target, origin, line)?;
            let data = unknown(rtype, encode_name(&target));
            return Ok((data, Some(target)));
        }
        _ => return Err(invalid()),
    };
    Ok((data, None))
}

fn generic(rtype: RecordType, text: &[&str], line: usize) -> Result<RData, Error> {
    let invalid = || Error::zone_parse(line, format!("invalid generic {rtype} record data"));
    let (length, hex) = text.split_first().ok_or_else(invalid)?;
    let length: usize = length.parse().map_err(|_| invalid())?;
    let wire = decode_hex(&hex.concat()).ok_or_else(invalid)?;
    if wire.len() != length {
        return Err(invalid());
    }
    Ok(unknown(rtype, wire))
}

fn unknown(rtype: RecordType, wire: Vec<u8>) -> RData {
    RData::Unknown {
        code: u16::from(rtype),
        rdata: NULL::with(wire),
    }
}

/// Uncompressed wire form of `name`.
fn encode_name(name: &Name) -> Vec<u8> {
    let mut wire = Vec::new();
    for label in name.iter() {
        // NB: labels are at most 63 bytes, enforced by Name.
        wire.push(u8::try_from(label.len()).unwrap_or(u8::MAX));
        wire.extend_from_slice(label);
    }
    wire.push(0);
    wire
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
