use std::borrow::Cow;

const MAX_TAG_LEN: usize = 1024;
// Longest named entity is `&CounterClockwiseContourIntegral;`.
const MAX_ENTITY_LEN: usize = 33;

/// Neutralises terminal control characters so that untrusted text cannot move the cursor,
/// recolour the screen or rewrite earlier output. Newlines and tabs are kept.
pub fn sanitize_text(text: &str) -> Cow<'_, str> {
    if !text.chars().any(is_unsafe) {
        return Cow::Borrowed(text);
    }

    Cow::Owned(
        text.chars()
            .filter(|c| *c != '\r')
            .map(|c| if is_unsafe(c) { '\u{FFFD}' } else { c })
            .collect(),
    )
}

fn is_unsafe(c: char) -> bool {
    c.is_control() && c != '\n' && c != '\t'
}

/// Turns an HTML stream into plain terminal text.
///
/// Tags and entities may be split across any number of `push` calls; the unfinished part is
/// held until it can be resolved. Content of `head`, `title`, `style` and `script` is dropped.
#[derive(Debug, Default)]
pub struct MarkupFilter {
    pending: String,
    quote: Option<char>,
    skipping: Option<String>,
}

impl MarkupFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            self.feed(c, &mut out);
        }
        out
    }

    /// Emits anything still held back. An unterminated tag or entity is shown as typed.
    pub fn finish(&mut self) -> String {
        let mut out = String::new();
        self.quote = None;
        let rest = std::mem::take(&mut self.pending);
        for c in rest.chars() {
            self.emit(c, &mut out);
        }
        out
    }

    fn feed(&mut self, c: char, out: &mut String) {
        if self.pending.starts_with('<') {
            if self.pending.len() == 1 && !(c.is_ascii_alphabetic() || c == '/' || c == '!') {
                self.pending.clear();
                self.emit('<', out);
                self.feed(c, out);
            } else if self.pending.len() >= MAX_TAG_LEN {
                self.flush_literal(out);
                self.feed(c, out);
            } else if let Some(q) = self.quote {
                if c == q {
                    self.quote = None;
                }
                self.pending.push(c);
            } else if (c == '"' || c == '\'') && self.in_attribute_value() {
                self.quote = Some(c);
                self.pending.push(c);
            } else if c == '>' && !self.in_open_comment() {
                let tag = std::mem::take(&mut self.pending);
                self.apply_tag(&tag[1..], out);
            } else {
                self.pending.push(c);
            }
            return;
        }

        if self.pending.starts_with('&') {
            if c == ';' {
                let mut entity = std::mem::take(&mut self.pending);
                entity.push(';');
                let decoded = html_escape::decode_html_entities(&entity);
                for ch in decoded.chars() {
                    self.emit(ch, out);
                }
            } else if self.pending.len() < MAX_ENTITY_LEN
                && (c.is_ascii_alphanumeric() || (c == '#' && self.pending.len() == 1))
            {
                self.pending.push(c);
            } else {
                self.flush_literal(out);
                self.feed(c, out);
            }
            return;
        }

        match c {
            '<' | '&' => self.pending.push(c),
            _ => self.emit(c, out),
        }
    }

    /// True right after `=` inside a tag, where a quoted value may hold `>`.
    fn in_attribute_value(&self) -> bool {
        !self.pending.starts_with("<!") && self.pending.trim_end().ends_with('=')
    }

    fn in_open_comment(&self) -> bool {
        self.pending.starts_with("<!--") && !(self.pending.len() >= 6 && self.pending.ends_with("--"))
    }

    fn flush_literal(&mut self, out: &mut String) {
        self.quote = None;
        let literal = std::mem::take(&mut self.pending);
        for ch in literal.chars() {
            self.emit(ch, out);
        }
    }

    fn emit(&self, c: char, out: &mut String) {
        if self.skipping.is_none() {
            out.push(c);
        }
    }

    fn apply_tag(&mut self, tag: &str, out: &mut String) {
        let body = tag.trim_end_matches('/').trim();
        if body.starts_with('!') || body.starts_with('?') {
            return;
        }

        let (closing, rest) = match body.strip_prefix('/') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, body),
        };
        let name = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        if let Some(skip) = &self.skipping {
            if closing && *skip == name {
                self.skipping = None;
            }
            return;
        }

        match (closing, name.as_str()) {
            (false, "head" | "title" | "style" | "script") => self.skipping = Some(name),
            (_, "br") => out.push('\n'),
            (false, "hr") => out.push_str("\n----\n"),
            (false, "li") => out.push_str("- "),
            (
                true,
                "p" | "div" | "pre" | "li" | "tr" | "ul" | "ol" | "table" | "blockquote" | "h1"
                | "h2" | "h3" | "h4" | "h5" | "h6",
            ) => out.push('\n'),
            _ => {}
        }
    }
}
