//! Channel 0 management messages
//!
//! Builders and parsers for `<greeting>`, `<start>`, `<close>`, `<profile>`,
//! `<ok>` and `<error>`. The parser is a small element scanner: enough XML
//! for these documents (attributes in either quote style, entities, CDATA,
//! comments and a prolog), nothing more.

use beep_core::{BeepError, Result};

/// A parsed element
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Concatenated character data, entities resolved
    pub text: String,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Request received on channel 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Start {
        number: u32,
        server_name: Option<String>,
        profile: String,
        encoding: Option<String>,
        piggyback: Option<String>,
    },
    Close {
        number: u32,
        code: u32,
    },
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn error(&self, what: &str) -> BeepError {
        BeepError::Protocol(format!("malformed management message: {} at offset {}", what, self.pos))
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    /// Skip up to and including `end`.
    fn skip_past(&mut self, end: &str) -> Result<()> {
        match self.rest().find(end) {
            Some(i) => {
                self.pos += i + end.len();
                Ok(())
            }
            None => Err(self.error("unterminated markup")),
        }
    }

    /// Prolog, comments and processing instructions before the root.
    fn skip_misc(&mut self) -> Result<()> {
        loop {
            self.skip_ws();
            if self.eat("<?") {
                self.skip_past("?>")?;
            } else if self.eat("<!--") {
                self.skip_past("-->")?;
            } else if self.rest().starts_with("<!DOCTYPE") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn name(&mut self) -> Result<String> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>' || c == '=')
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected a name"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn element(&mut self) -> Result<Element> {
        if !self.eat("<") {
            return Err(self.error("expected '<'"));
        }
        let mut el = Element { name: self.name()?, ..Default::default() };
        loop {
            self.skip_ws();
            if self.eat("/>") {
                return Ok(el);
            }
            if self.eat(">") {
                break;
            }
            let attr = self.name()?;
            self.skip_ws();
            if !self.eat("=") {
                return Err(self.error("expected '='"));
            }
            self.skip_ws();
            let quote = match self.rest().chars().next() {
                Some(q @ ('\'' | '"')) => q,
                _ => return Err(self.error("expected a quoted value")),
            };
            self.pos += 1;
            let end = self.rest().find(quote).ok_or_else(|| self.error("unterminated attribute"))?;
            let value = unescape(&self.rest()[..end]);
            self.pos += end + 1;
            el.attrs.push((attr, value));
        }

        loop {
            if self.eat("</") {
                let closing = self.name()?;
                if closing != el.name {
                    return Err(self.error("mismatched closing tag"));
                }
                self.skip_ws();
                if !self.eat(">") {
                    return Err(self.error("expected '>'"));
                }
                return Ok(el);
            }
            if self.eat("<![CDATA[") {
                let end = self.rest().find("]]>").ok_or_else(|| self.error("unterminated CDATA"))?;
                el.text.push_str(&self.rest()[..end]);
                self.pos += end + 3;
            } else if self.eat("<!--") {
                self.skip_past("-->")?;
            } else if self.rest().starts_with('<') {
                el.children.push(self.element()?);
            } else {
                let end = self.rest().find('<').ok_or_else(|| self.error("unterminated element"))?;
                el.text.push_str(&unescape(&self.rest()[..end]));
                self.pos += end;
            }
        }
    }
}

/// Parse a management document into its root element.
pub fn parse(xml: &str) -> Result<Element> {
    let mut sc = Scanner { src: xml, pos: 0 };
    sc.skip_misc()?;
    let root = sc.element()?;
    sc.skip_misc()?;
    if !sc.rest().trim().is_empty() {
        return Err(sc.error("trailing content"));
    }
    Ok(root)
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        let end = match rest.find(';') {
            Some(e) => e,
            None => break,
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "apos" => Some('\''),
            "quot" => Some('"'),
            _ => entity
                .strip_prefix("#x")
                .and_then(|h| u32::from_str_radix(h, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn number_attr(el: &Element, name: &str) -> Result<u32> {
    el.attr(name)
        .ok_or_else(|| BeepError::Protocol(format!("<{}> without {}", el.name, name)))?
        .trim()
        .parse()
        .map_err(|_| BeepError::Protocol(format!("<{}> has a bad {}", el.name, name)))
}

pub fn build_greeting(profiles: &[String]) -> String {
    if profiles.is_empty() {
        return "<greeting />\r\n".to_string();
    }
    let mut out = String::from("<greeting>\r\n");
    for uri in profiles {
        out.push_str(&format!("   <profile uri='{}' />\r\n", escape(uri)));
    }
    out.push_str("</greeting>\r\n");
    out
}

/// Profile URIs advertised by a greeting.
pub fn parse_greeting(xml: &str) -> Result<Vec<String>> {
    let root = parse(xml)?;
    if root.name != "greeting" {
        return Err(BeepError::Protocol(format!("expected <greeting>, got <{}>", root.name)));
    }
    Ok(root
        .children
        .iter()
        .filter(|c| c.name == "profile")
        .filter_map(|c| c.attr("uri").map(str::to_string))
        .collect())
}

pub fn build_start(
    number: u32,
    server_name: Option<&str>,
    profile: &str,
    encoding: Option<&str>,
    piggyback: Option<&str>,
) -> String {
    let mut out = format!("<start number='{}'", number);
    if let Some(name) = server_name {
        out.push_str(&format!(" serverName='{}'", escape(name)));
    }
    out.push_str(&format!(">\r\n   <profile uri='{}'", escape(profile)));
    if let Some(enc) = encoding {
        out.push_str(&format!(" encoding='{}'", escape(enc)));
    }
    match piggyback {
        Some(content) => out.push_str(&format!("><![CDATA[{}]]></profile>\r\n", content)),
        None => out.push_str(" />\r\n"),
    }
    out.push_str("</start>\r\n");
    out
}

/// Positive reply to a start request.
pub fn build_profile_reply(profile: &str, piggyback: Option<&str>) -> String {
    match piggyback {
        Some(content) => format!("<profile uri='{}'><![CDATA[{}]]></profile>\r\n", escape(profile), content),
        None => format!("<profile uri='{}' />\r\n", escape(profile)),
    }
}

/// URI and piggyback of a positive start reply.
pub fn parse_profile_reply(xml: &str) -> Result<(String, Option<String>)> {
    let root = parse(xml)?;
    if root.name != "profile" {
        return Err(BeepError::Protocol(format!("expected <profile>, got <{}>", root.name)));
    }
    let uri = root
        .attr("uri")
        .ok_or_else(|| BeepError::Protocol("<profile> without uri".into()))?
        .to_string();
    let piggyback = (!root.text.trim().is_empty()).then(|| root.text.clone());
    Ok((uri, piggyback))
}

pub fn build_close(number: u32, code: u32) -> String {
    format!("<close number='{}' code='{}' />\r\n", number, code)
}

pub fn build_ok() -> String {
    "<ok />\r\n".to_string()
}

pub fn build_error(code: u32, message: &str) -> String {
    format!("<error code='{}'>{}</error>\r\n", code, escape(message))
}

pub fn is_ok(xml: &str) -> bool {
    matches!(parse(xml), Ok(root) if root.name == "ok")
}

/// Code and text of an `<error>` reply; unparseable replies give code 0
/// and the raw text.
pub fn parse_error(xml: &str) -> (u32, String) {
    match parse(xml) {
        Ok(root) if root.name == "error" => {
            let code = root.attr("code").and_then(|c| c.trim().parse().ok()).unwrap_or(0);
            (code, root.text.trim().to_string())
        }
        _ => (0, xml.trim().to_string()),
    }
}

/// Decode a MSG received on channel 0.
pub fn parse_request(xml: &str) -> Result<ControlMessage> {
    let root = parse(xml)?;
    match root.name.as_str() {
        "start" => {
            let number = number_attr(&root, "number")?;
            let profile = root
                .child("profile")
                .ok_or_else(|| BeepError::Protocol("<start> without <profile>".into()))?;
            let uri = profile
                .attr("uri")
                .ok_or_else(|| BeepError::Protocol("<profile> without uri".into()))?;
            Ok(ControlMessage::Start {
                number,
                server_name: root.attr("serverName").map(str::to_string),
                profile: uri.to_string(),
                encoding: profile.attr("encoding").map(str::to_string),
                piggyback: (!profile.text.trim().is_empty()).then(|| profile.text.clone()),
            })
        }
        "close" => Ok(ControlMessage::Close {
            number: number_attr(&root, "number")?,
            code: number_attr(&root, "code").unwrap_or(200),
        }),
        other => Err(BeepError::Protocol(format!("unknown management element <{}>", other))),
    }
}
