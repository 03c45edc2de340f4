//! Freeze/thaw: iterators as compact text cursors.
//!
//! A cursor is up to three `/`-separated pieces:
//!
//! ```text
//! SET / POSITION / STATE
//! ```
//!
//! SET alone recreates the iterator's identity; POSITION is the last id
//! returned (`-` unstarted, `@id`, `*` exhausted); STATE is optional
//! `[k:v]` resume detail and may be truncated away by the serialiser.
//! Dropping STATE is always legal: the thawed iterator re-drives from the
//! POSITION id and re-emits it before continuing.
//!
//! The SET text doubles as the *stamp* under which live originals and
//! storable caches are registered, so a thaw can rebind instead of
//! replaying. A `[cs:..]` checksum tail guards the whole cursor; unknown
//! `[k:v]` keys are skipped for forwards compatibility.

use crate::budget::{Budget, Found};
use crate::engine::ExecCtx;
use crate::error::{EngineError, EngineResult};
use crate::ids::{Guid, Linkage, PrimId};
use crate::iter::{
    AndIter, Comparator, DedupMethod, Direction, FixedBuilder, FreezeFlags, Iter, IsaIter,
    LinkIter, LinkSource, LinksToIter, NullIter, OrIter, ValueSpec, VRangeIter,
};
use crate::resource::LiveOriginal;
use crate::stats::Stats;

/// Iterator names reserved in the cursor grammar but never produced by
/// this planner. Thawing one is a syntax error, not a lexical one.
const RESERVED_TOKENS: [&str; 2] = ["prefix", "sort"];

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-'
}

/// Percent-encode anything that could collide with grammar punctuation.
fn esc(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_plain(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{b:02x}"));
        }
    }
    out
}

fn unesc(s: &str) -> EngineResult<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| EngineError::Lexical {
                    at: i,
                    what: "bad escape".into(),
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| EngineError::Syntax("escaped text is not utf-8".into()))
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

fn window(dir: Direction, low: PrimId, high: PrimId) -> String {
    format!("{}{}-{}", dir.token(), low, high)
}

fn stats_opt(stats: Option<&Stats>) -> String {
    match stats {
        None => String::new(),
        Some(s) => {
            let mut o = format!("[st:{},{},{},{}", s.check_cost, s.next_cost, s.find_cost, s.n);
            if let Some(tag) = &s.ordering {
                o.push(',');
                o.push_str(&esc(tag));
            }
            o.push(']');
            o
        }
    }
}

fn ordering_opt(ordering: Option<&str>) -> String {
    match ordering {
        None => String::new(),
        Some(tag) => format!("[o:{}]", esc(tag)),
    }
}

/// The SET piece of an iterator. Also its registration stamp.
pub fn set_string(it: &Iter) -> String {
    match it {
        Iter::Null(_) => "null:0-0:".to_string(),
        Iter::All(i) => format!(
            "all:{}:{}{}",
            window(i.dir, i.low, i.high),
            ordering_opt(i.ordering.as_deref()),
            stats_opt(i.stats.as_ref()),
        ),
        Iter::Fixed(i) => {
            let body = match &i.masquerade {
                Some(recipe) => format!("*({recipe})"),
                None => {
                    let ids: Vec<String> = i.ids.iter().map(|id| id.to_string()).collect();
                    format!("{}:{}", i.ids.len(), ids.join(","))
                }
            };
            let unsorted = if i.sorted() { "" } else { "[u]" };
            format!(
                "fixed:{}:{}{}{}{}",
                window(i.dir, i.low, i.high),
                body,
                unsorted,
                ordering_opt(i.ordering.as_deref()),
                stats_opt(i.stats.as_ref()),
            )
        }
        Iter::Link(i) => {
            let w = window(i.dir, i.low, i.high);
            let tail = format!(
                "{}{}",
                ordering_opt(i.ordering.as_deref()),
                stats_opt(i.stats.as_ref())
            );
            match &i.source {
                LinkSource::Gmap { linkage, guid } => {
                    format!("gmap:{}:{}:{}{}", w, linkage.token(), guid.to_hex(), tail)
                }
                LinkSource::Vip {
                    endpoint,
                    linkage,
                    typeguid,
                } => format!(
                    "vip:{}:{}:{}:{}{}",
                    w,
                    endpoint,
                    linkage.token(),
                    typeguid.to_hex(),
                    tail
                ),
                LinkSource::NameHash { name } => format!("hmap:{}:{}{}", w, esc(name), tail),
            }
        }
        Iter::VRange(i) => {
            let bound = |v: &Option<String>, incl: bool| match v {
                None => "*".to_string(),
                Some(x) => format!("{}{}", if incl { "i" } else { "x" }, esc(x)),
            };
            format!(
                "vrange:{}:{}:{}:{}{}",
                window(i.dir, i.low, i.high),
                i.cmp.token(),
                bound(&i.spec.lo, i.spec.lo_incl),
                bound(&i.spec.hi, i.spec.hi_incl),
                stats_opt(i.stats.as_ref()),
            )
        }
        Iter::And(i) => {
            let subs: Vec<String> = i.subs.iter().map(|s| format!("({})", set_string(s))).collect();
            let mut hints = String::new();
            if let Some(sz) = i.setsize_hint {
                hints.push_str(&format!("[sz:{sz}]"));
            }
            if let Some(pg) = i.pagesize_hint {
                hints.push_str(&format!("[pg:{pg}]"));
            }
            format!(
                "and:{}:{}:{}{}{}{}",
                window(i.dir, i.low, i.high),
                i.subs.len(),
                subs.join(""),
                hints,
                ordering_opt(i.ordering_req.as_deref()),
                stats_opt(i.stats()),
            )
        }
        Iter::Or(i) => {
            let body = match &i.masquerade {
                Some(recipe) => format!("*({recipe})"),
                None => {
                    let subs: Vec<String> =
                        i.subs.iter().map(|s| format!("({})", set_string(s))).collect();
                    format!("{}:{}", i.subs.len(), subs.join(""))
                }
            };
            format!(
                "or:{}:{}{}{}",
                window(i.dir, i.low, i.high),
                body,
                ordering_opt(i.ordering_req.as_deref()),
                stats_opt(i.stats.as_ref()),
            )
        }
        Iter::Isa(i) => format!(
            "isa:{}:{}:({}){}",
            window(i.dir, i.low, i.high),
            i.linkage.token(),
            set_string(&i.sub),
            stats_opt(i.stats()),
        ),
        Iter::LinksTo(i) => {
            let hint = if i.hinted {
                format!("[h:({})]", set_string(&i.driver))
            } else {
                String::new()
            };
            format!(
                "linksto:{}:{}:({}){}{}",
                window(i.dir, i.low, i.high),
                i.linkage.token(),
                set_string(&i.sub),
                hint,
                stats_opt(i.stats.as_ref()),
            )
        }
    }
}

fn position_string(it: &Iter) -> String {
    let pos = it.pos();
    if pos.eof {
        "*".to_string()
    } else {
        match pos.last {
            Some(id) => format!("@{id}"),
            None => "-".to_string(),
        }
    }
}

fn state_string(it: &Iter) -> String {
    match it {
        Iter::And(i) => {
            let mut s = String::new();
            if let Some(p) = i.plan_producer() {
                s.push_str(&format!("[p:{p}]"));
            }
            s.push_str(&format!("[off:{}]", i.read_off));
            let subpos: Vec<String> = i
                .subs
                .iter()
                .map(|sub| match sub.pos().last {
                    Some(id) => id.to_string(),
                    None => "-".to_string(),
                })
                .collect();
            s.push_str(&format!("[sp:{}]", subpos.join(",")));
            s
        }
        Iter::Isa(i) => {
            let mut s = String::new();
            if let Some(m) = i.method() {
                s.push_str(&format!("[m:{}]", m.token()));
            }
            s.push_str(&format!("[off:{}]", i.read_off));
            match i.last_src {
                Some(id) => s.push_str(&format!("[src:{id}]")),
                None => s.push_str("[src:-]"),
            }
            s
        }
        _ => String::new(),
    }
}

/// Serialise `it` into cursor text. STATE is dropped when it would exceed
/// the configured cap; the cursor stays valid, just slower to resume.
pub fn freeze(it: &Iter, flags: FreezeFlags, state_cap: usize) -> String {
    let mut out = String::new();
    if flags.set {
        out.push_str(&set_string(it));
    }
    if flags.position {
        out.push('/');
        out.push_str(&position_string(it));
        if flags.state {
            let st = state_string(it);
            if !st.is_empty() && st.len() <= state_cap {
                out.push('/');
                out.push_str(&st);
            }
        }
    }
    let sum = crc32fast::hash(out.as_bytes());
    out.push_str(&format!("[cs:{sum:08x}]"));
    out
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

struct Scanner<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(s: &'a str) -> Self {
        Scanner {
            s: s.as_bytes(),
            pos: 0,
        }
    }

    fn err(&self, what: &str) -> EngineError {
        EngineError::Lexical {
            at: self.pos,
            what: what.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: u8) -> EngineResult<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.err(&format!("expected '{}'", c as char)))
        }
    }

    fn done(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn number(&mut self) -> EngineResult<u64> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.err("expected a number"));
        }
        std::str::from_utf8(&self.s[start..self.pos])
            .ok()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| self.err("number out of range"))
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.s[start..self.pos]).into_owned()
    }

    /// Escaped text up to (not including) any of `stops` at depth zero.
    fn escaped_until(&mut self, stops: &[u8]) -> EngineResult<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if stops.contains(&b) {
                break;
            }
            self.pos += 1;
        }
        unesc(std::str::from_utf8(&self.s[start..self.pos]).map_err(|_| self.err("not utf-8"))?)
    }

    /// A parenthesised group; returns the inner text, consuming `(..)`.
    fn paren_group(&mut self) -> EngineResult<&'a str> {
        self.expect(b'(')?;
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(b) = self.bump() {
            match b {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return std::str::from_utf8(&self.s[start..self.pos - 1])
                            .map_err(|_| self.err("not utf-8"));
                    }
                }
                _ => {}
            }
        }
        Err(self.err("unterminated '('"))
    }

    /// Trailing `[k:v]` options; unknown keys are the caller's business.
    fn options(&mut self) -> EngineResult<Vec<(String, String)>> {
        let mut out = Vec::new();
        while self.peek() == Some(b'[') {
            self.pos += 1;
            let key_start = self.pos;
            while matches!(self.peek(), Some(b) if b != b':' && b != b']') {
                self.pos += 1;
            }
            let key = String::from_utf8_lossy(&self.s[key_start..self.pos]).into_owned();
            let value = if self.eat(b':') {
                let val_start = self.pos;
                let mut depth = 0usize;
                loop {
                    match self.peek() {
                        None => return Err(self.err("unterminated '['")),
                        Some(b'[') | Some(b'(') => depth += 1,
                        Some(b')') => depth = depth.saturating_sub(1),
                        Some(b']') if depth == 0 => break,
                        Some(b']') => depth -= 1,
                        Some(_) => {}
                    }
                    self.pos += 1;
                }
                String::from_utf8_lossy(&self.s[val_start..self.pos]).into_owned()
            } else {
                String::new()
            };
            self.expect(b']')?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// `dir? low "-" high`
    fn window(&mut self) -> EngineResult<(Direction, PrimId, PrimId)> {
        let dir = if self.eat(b'~') {
            Direction::Backward
        } else {
            Direction::Forward
        };
        let low = self.number()?;
        self.expect(b'-')?;
        let high = self.number()?;
        Ok((dir, low, high))
    }
}

// ---------------------------------------------------------------------------
// Thaw
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PosTok {
    Start,
    At(PrimId),
    Eof,
}

/// Split into SET / POSITION / STATE at depth zero.
fn split_pieces(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, b) in text.bytes().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            b'/' if depth == 0 => {
                out.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&text[start..]);
    out
}

/// Verify and strip the `[cs:..]` tail, if any.
fn verify_checksum(text: &str) -> EngineResult<&str> {
    let Some(idx) = text.rfind("[cs:") else {
        return Ok(text);
    };
    let tail = &text[idx..];
    let body = &text[..idx];
    let hex = tail
        .strip_prefix("[cs:")
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| EngineError::Lexical {
            at: idx,
            what: "malformed checksum".into(),
        })?;
    let want = u32::from_str_radix(hex, 16).map_err(|_| EngineError::Lexical {
        at: idx,
        what: "malformed checksum".into(),
    })?;
    let got = crc32fast::hash(body.as_bytes());
    if want != got {
        return Err(EngineError::Lexical {
            at: idx,
            what: format!("checksum mismatch ({got:08x} != {want:08x})"),
        });
    }
    Ok(body)
}

fn parse_stats(v: &str) -> EngineResult<Stats> {
    let parts: Vec<&str> = v.split(',').collect();
    if parts.len() < 4 {
        return Err(EngineError::Syntax(format!("bad stats option '{v}'")));
    }
    let num = |s: &str| -> EngineResult<i64> {
        s.parse()
            .map_err(|_| EngineError::Syntax(format!("bad stats number '{s}'")))
    };
    let mut stats = Stats::new(num(parts[0])?, num(parts[1])?, num(parts[2])?, num(parts[3])? as u64);
    if let Some(tag) = parts.get(4) {
        stats.ordering = Some(unesc(tag)?);
    }
    Ok(stats)
}

fn parse_linkage(sc: &mut Scanner<'_>) -> EngineResult<Linkage> {
    let tok = sc.ident();
    Linkage::from_token(&tok)
        .ok_or_else(|| EngineError::Syntax(format!("unknown linkage '{tok}'")))
}

fn parse_guid(sc: &mut Scanner<'_>) -> EngineResult<Guid> {
    let start = sc.pos;
    while matches!(sc.peek(), Some(b) if b.is_ascii_hexdigit()) {
        sc.pos += 1;
    }
    let hex = std::str::from_utf8(&sc.s[start..sc.pos]).expect("hex digits are utf-8");
    Guid::from_hex(hex).ok_or_else(|| EngineError::Syntax(format!("bad guid '{hex}'")))
}

/// Parse one SET piece into a fresh iterator.
pub fn parse_set(text: &str, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    let mut sc = Scanner::new(text);
    let kind = sc.ident();
    sc.expect(b':')?;
    let it = match kind.as_str() {
        "null" => {
            let _ = sc.window()?;
            sc.expect(b':')?;
            Iter::Null(NullIter)
        }
        "all" => {
            let (dir, low, high) = sc.window()?;
            sc.expect(b':')?;
            let mut it = crate::iter::AllIter::new(low, high, dir);
            for (k, v) in sc.options()? {
                match k.as_str() {
                    "o" => it.ordering = Some(unesc(&v)?),
                    "st" => it.stats = Some(parse_stats(&v)?),
                    _ => {}
                }
            }
            Iter::All(it)
        }
        "fixed" => parse_fixed(&mut sc, ctx)?,
        "gmap" => {
            let (dir, low, high) = sc.window()?;
            sc.expect(b':')?;
            let linkage = parse_linkage(&mut sc)?;
            sc.expect(b':')?;
            let guid = parse_guid(&mut sc)?;
            let mut it = LinkIter::new(ctx.store, LinkSource::Gmap { linkage, guid }, low, high, dir);
            apply_link_options(&mut sc, &mut it)?;
            Iter::Link(it)
        }
        "vip" => {
            let (dir, low, high) = sc.window()?;
            sc.expect(b':')?;
            let endpoint = sc.number()?;
            sc.expect(b':')?;
            let linkage = parse_linkage(&mut sc)?;
            sc.expect(b':')?;
            let typeguid = parse_guid(&mut sc)?;
            let mut it = LinkIter::new(
                ctx.store,
                LinkSource::Vip {
                    endpoint,
                    linkage,
                    typeguid,
                },
                low,
                high,
                dir,
            );
            apply_link_options(&mut sc, &mut it)?;
            Iter::Link(it)
        }
        "hmap" => {
            let (dir, low, high) = sc.window()?;
            sc.expect(b':')?;
            let name = sc.escaped_until(&[b'['])?;
            let mut it = LinkIter::new(ctx.store, LinkSource::NameHash { name }, low, high, dir);
            apply_link_options(&mut sc, &mut it)?;
            Iter::Link(it)
        }
        "vrange" => {
            let (dir, low, high) = sc.window()?;
            sc.expect(b':')?;
            let cmp_tok = sc.ident();
            let cmp = Comparator::from_token(&cmp_tok)
                .ok_or_else(|| EngineError::Syntax(format!("unknown comparator '{cmp_tok}'")))?;
            sc.expect(b':')?;
            let lo = parse_vbound(&mut sc, &[b':'])?;
            sc.expect(b':')?;
            let hi = parse_vbound(&mut sc, &[b'['])?;
            let (lo, lo_incl) = match lo {
                Some((v, incl)) => (Some(v), incl),
                None => (None, true),
            };
            let (hi, hi_incl) = match hi {
                Some((v, incl)) => (Some(v), incl),
                None => (None, false),
            };
            let spec = ValueSpec {
                lo,
                lo_incl,
                hi,
                hi_incl,
            };
            let mut it = VRangeIter::new(cmp, spec, low, high, dir);
            for (k, v) in sc.options()? {
                if k == "st" {
                    it.stats = Some(parse_stats(&v)?);
                }
            }
            Iter::VRange(it)
        }
        "and" => parse_and(&mut sc, ctx)?,
        "or" => parse_or(&mut sc, ctx)?,
        "isa" => parse_isa(&mut sc, ctx)?,
        "linksto" => parse_linksto(&mut sc, ctx)?,
        other if RESERVED_TOKENS.contains(&other) => {
            return Err(EngineError::Syntax(format!(
                "reserved iterator '{other}' in cursor"
            )));
        }
        other => {
            return Err(EngineError::Syntax(format!("unknown iterator '{other}'")));
        }
    };
    Ok(it)
}

type VBound = Option<(String, bool)>;

fn parse_vbound(sc: &mut Scanner<'_>, stops: &[u8]) -> EngineResult<VBound> {
    if sc.eat(b'*') {
        return Ok(None);
    }
    let incl = match sc.bump() {
        Some(b'i') => true,
        Some(b'x') => false,
        _ => return Err(sc.err("expected 'i', 'x' or '*'")),
    };
    let val = sc.escaped_until(stops)?;
    Ok(Some((val, incl)))
}

fn apply_link_options(sc: &mut Scanner<'_>, it: &mut LinkIter) -> EngineResult<()> {
    for (k, v) in sc.options()? {
        match k.as_str() {
            "o" => it.ordering = Some(unesc(&v)?),
            "st" => it.stats = Some(parse_stats(&v)?),
            _ => {}
        }
    }
    Ok(())
}

fn parse_fixed(sc: &mut Scanner<'_>, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    let (dir, low, high) = sc.window()?;
    sc.expect(b':')?;
    let mut builder = FixedBuilder::new(low, high, dir);
    let mut masquerade = None;
    if sc.peek() == Some(b'*') {
        sc.pos += 1;
        let recipe = sc.paren_group()?.to_string();
        // Materialise the masqueraded set by replaying its recipe.
        let mut source = parse_set(&recipe, ctx)?;
        let mut budget = Budget::unlimited();
        loop {
            match source.next(ctx, &mut budget) {
                crate::budget::Step::Emit(id) => builder.add(id),
                crate::budget::Step::Done => break,
                crate::budget::Step::More => unreachable!("unlimited budget"),
            }
        }
        masquerade = Some(recipe);
    } else {
        let n = sc.number()? as usize;
        sc.expect(b':')?;
        for k in 0..n {
            if k > 0 {
                sc.expect(b',')?;
            }
            builder.add(sc.number()?);
        }
    }
    let mut sorted = true;
    let mut ordering = None;
    let mut stats = None;
    for (k, v) in sc.options()? {
        match k.as_str() {
            "u" => sorted = false,
            "o" => ordering = Some(unesc(&v)?),
            "st" => stats = Some(parse_stats(&v)?),
            _ => {}
        }
    }
    let mut it = builder.commit(sorted);
    it.masquerade = masquerade;
    it.ordering = ordering;
    it.stats = stats;
    Ok(Iter::Fixed(it))
}

fn parse_subsets(sc: &mut Scanner<'_>, ctx: &ExecCtx<'_>) -> EngineResult<Vec<Iter>> {
    let n = sc.number()? as usize;
    sc.expect(b':')?;
    let mut subs = Vec::with_capacity(n);
    for _ in 0..n {
        let inner = sc.paren_group()?;
        subs.push(parse_set(inner, ctx)?);
    }
    Ok(subs)
}

fn parse_and(sc: &mut Scanner<'_>, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    let (dir, low, high) = sc.window()?;
    sc.expect(b':')?;
    let subs = parse_subsets(sc, ctx)?;
    let mut ordering_req = None;
    let mut stats = None;
    let mut setsize = None;
    let mut pagesize = None;
    for (k, v) in sc.options()? {
        match k.as_str() {
            "o" => ordering_req = Some(unesc(&v)?),
            "st" => stats = Some(parse_stats(&v)?),
            "sz" => setsize = v.parse().ok(),
            "pg" => pagesize = v.parse().ok(),
            _ => {}
        }
    }
    let mut it = AndIter::compose(subs, low, high, dir, ordering_req)
        .map_err(|e| EngineError::Syntax(e.to_string()))?;
    if let Iter::And(a) = &mut it {
        a.setsize_hint = setsize;
        a.pagesize_hint = pagesize;
        if let Some(stats) = stats {
            // The elected producer travels in STATE; until it arrives,
            // first sorted sub wins, matching the contest's tie-break.
            let producer = a.subs.iter().position(|s| s.sorted()).unwrap_or(0);
            a.install_plan(stats, producer);
        }
    }
    Ok(it)
}

fn parse_or(sc: &mut Scanner<'_>, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    let (dir, low, high) = sc.window()?;
    sc.expect(b':')?;
    if sc.peek() == Some(b'*') {
        sc.pos += 1;
        let recipe = sc.paren_group()?;
        return parse_set(recipe, ctx);
    }
    let subs = parse_subsets(sc, ctx)?;
    let mut ordering_req = None;
    let mut stats = None;
    for (k, v) in sc.options()? {
        match k.as_str() {
            "o" => ordering_req = Some(unesc(&v)?),
            "st" => stats = Some(parse_stats(&v)?),
            _ => {}
        }
    }
    let mut it = OrIter::compose(subs, low, high, dir, ordering_req)
        .map_err(|e| EngineError::Syntax(e.to_string()))?;
    if let Iter::Or(o) = &mut it {
        o.stats = stats;
    }
    Ok(it)
}

fn parse_isa(sc: &mut Scanner<'_>, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    let (dir, low, high) = sc.window()?;
    sc.expect(b':')?;
    let linkage = parse_linkage(sc)?;
    sc.expect(b':')?;
    let inner = sc.paren_group()?;
    let sub = parse_set(inner, ctx)?;
    let mut stats = None;
    for (k, v) in sc.options()? {
        if k == "st" {
            stats = Some(parse_stats(&v)?);
        }
    }
    let mut it = IsaIter::new(sub, linkage, low, high, dir);
    if let (Iter::Isa(i), Some(stats)) = (&mut it, stats) {
        // Provisional method by the standing rule; STATE may override and
        // a failed cache rebind may upgrade.
        let method = if i.sub.sorted() && stats.n >= ctx.config.engine.isa_huge {
            DedupMethod::Intersect
        } else {
            DedupMethod::Storable
        };
        i.install(stats, method);
    }
    Ok(it)
}

fn parse_linksto(sc: &mut Scanner<'_>, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    let (dir, low, high) = sc.window()?;
    sc.expect(b':')?;
    let linkage = parse_linkage(sc)?;
    sc.expect(b':')?;
    let inner = sc.paren_group()?;
    let sub = parse_set(inner, ctx)?;
    let mut hint = None;
    let mut stats = None;
    for (k, v) in sc.options()? {
        match k.as_str() {
            "h" => {
                let trimmed = v
                    .strip_prefix('(')
                    .and_then(|t| t.strip_suffix(')'))
                    .ok_or_else(|| EngineError::Syntax("bad linksto hint".into()))?;
                hint = Some(parse_set(trimmed, ctx)?);
            }
            "st" => stats = Some(parse_stats(&v)?),
            _ => {}
        }
    }
    let mut it = LinksToIter::new(sub, linkage, hint, low, high, dir);
    if let Iter::LinksTo(l) = &mut it {
        l.stats = stats;
    }
    Ok(it)
}

fn parse_position(text: &str) -> EngineResult<PosTok> {
    let mut sc = Scanner::new(text);
    let tok = match sc.bump() {
        Some(b'-') => PosTok::Start,
        Some(b'*') => PosTok::Eof,
        Some(b'@') => PosTok::At(sc.number()?),
        _ => return Err(sc.err("expected '-', '*' or '@id'")),
    };
    if !sc.done() {
        return Err(sc.err("trailing position text"));
    }
    Ok(tok)
}

fn parse_state(text: &str) -> EngineResult<Vec<(String, String)>> {
    let mut sc = Scanner::new(text);
    let opts = sc.options()?;
    if !sc.done() {
        return Err(sc.err("trailing state text"));
    }
    Ok(opts)
}

/// Reconstruct an iterator from cursor text.
///
/// Recovery ladder, most to least exact: rebind to a live original (AND or
/// ISA) by stamp; re-link a surviving storable cache; fall back to a
/// producer position hint plus `resume_id` replay. The last rung is always
/// available, so a cursor never becomes unusable just because shared state
/// was evicted.
pub fn thaw(text: &str, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    let body = verify_checksum(text)?;
    let pieces = split_pieces(body);
    if pieces.len() > 3 || pieces[0].is_empty() {
        return Err(EngineError::Syntax("cursor needs 1-3 pieces".into()));
    }
    let mut it = parse_set(pieces[0], ctx)?;
    let pos = match pieces.get(1) {
        Some(p) => parse_position(p)?,
        None => PosTok::Start,
    };
    let state = match pieces.get(2) {
        Some(p) => parse_state(p)?,
        None => Vec::new(),
    };
    let stamp = set_string(&it);
    apply_recovery(&mut it, ctx, &stamp, pos, &state)?;
    Ok(it)
}

fn state_get<'v>(state: &'v [(String, String)], key: &str) -> Option<&'v str> {
    state
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn apply_recovery(
    it: &mut Iter,
    ctx: &ExecCtx<'_>,
    stamp: &str,
    pos: PosTok,
    state: &[(String, String)],
) -> EngineResult<()> {
    match pos {
        PosTok::Start => return Ok(()),
        PosTok::Eof => {
            it.set_eof();
            return Ok(());
        }
        PosTok::At(last) => {
            let off: usize = state_get(state, "off").and_then(|v| v.parse().ok()).unwrap_or(0);
            match it {
                Iter::And(a) => {
                    if let Some(p) = state_get(state, "p").and_then(|v| v.parse().ok()) {
                        a.set_producer(p);
                    }
                    let rebound = match ctx.resources.find_original(stamp) {
                        Some(LiveOriginal::And(arc)) => a.rebind(arc, off),
                        _ => false,
                    };
                    if rebound {
                        tracing::debug!(stamp, off, "and cursor rebound to live original");
                        return Ok(());
                    }
                    // Fail-soft: position the producer near its saved spot
                    // and replay to the resume id.
                    if let (Some(p), Some(sp)) = (
                        a.plan_producer(),
                        state_get(state, "sp"),
                    ) {
                        let hints: Vec<&str> = sp.split(',').collect();
                        if let Some(hint) = hints.get(p).and_then(|h| h.parse::<PrimId>().ok()) {
                            if a.subs[p].sorted() {
                                let _ = a.subs[p].find(hint, ctx, &mut Budget::unlimited());
                            }
                        }
                    }
                    tracing::debug!(stamp, "and cursor replaying from resume id");
                    a.pos.resume = Some(last);
                }
                Iter::Isa(i) => {
                    if let Some(m) = state_get(state, "m").and_then(DedupMethod::from_token) {
                        i.set_method(m);
                    }
                    let rebound = match ctx.resources.find_original(stamp) {
                        Some(LiveOriginal::Isa(arc)) => i.rebind(arc, off),
                        _ => false,
                    };
                    let mut recovered = rebound;
                    if !rebound && i.method() != Some(DedupMethod::Intersect) {
                        if let Some(cache) = ctx.resources.link_cache(stamp) {
                            let adjusted = {
                                let guard = cache.lock();
                                if off <= guard.nelems() {
                                    Some(off)
                                } else {
                                    // Saved offset outruns the surviving
                                    // log; the slow scan re-anchors on the
                                    // last emitted id.
                                    guard.id_to_offset(last).map(|o| o + 1)
                                }
                            };
                            if let Some(o) = adjusted {
                                i.attach_cache(cache, o);
                                recovered = true;
                                tracing::debug!(stamp, off = o, "isa cursor re-linked storable cache");
                            }
                        }
                    }
                    if recovered {
                        // Position the source near its saved spot so the
                        // frontier extends instead of replaying.
                        if let Some(src) = state_get(state, "src").and_then(|v| v.parse().ok()) {
                            if i.sub.sorted() {
                                let _ = i.sub.find(src, ctx, &mut Budget::unlimited());
                            }
                        }
                        return Ok(());
                    }
                    // Cache lost. A sorted source with a huge projected
                    // output is cheaper to intersect than to re-hash.
                    if i.method() == Some(DedupMethod::Storable)
                        && i.sub.sorted()
                        && i.stats().map(|s| s.n >= ctx.config.engine.isa_huge).unwrap_or(false)
                    {
                        tracing::debug!(stamp, "isa cursor upgrading storable to intersect");
                        i.set_method(DedupMethod::Intersect);
                    }
                    tracing::debug!(stamp, "isa cursor replaying from resume id");
                    i.pos.resume = Some(last);
                }
                _ => {
                    // Leaves position exactly; a vanished id degrades to a
                    // replay that skips forward.
                    if it.sorted() {
                        match it.find(last, ctx, &mut Budget::unlimited()) {
                            Found::At(x) if x == last => {}
                            Found::At(_) => {
                                it.reset();
                                it.set_resume(last);
                            }
                            Found::Done => {}
                            Found::More => unreachable!("unlimited budget"),
                        }
                    } else {
                        it.set_resume(last);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Step;
    use crate::config::EngineConfig;
    use crate::iter::FixedIter;
    use crate::resource::ResourceCache;
    use crate::store::{MemStore, PrimitiveSpec, PrimitiveStore};

    fn collect(it: &mut Iter, ctx: &ExecCtx<'_>) -> Vec<PrimId> {
        let mut b = Budget::unlimited();
        let mut out = Vec::new();
        while let Step::Emit(id) = it.next(ctx, &mut b) {
            out.push(id);
        }
        out
    }

    #[test]
    fn test_escape_round_trip() {
        for s in ["plain", "with space", "a/b:c(d)[e]", "100%", ""] {
            assert_eq!(unesc(&esc(s)).unwrap(), s);
        }
    }

    #[test]
    fn test_fixed_set_round_trip() {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let it = Iter::Fixed(FixedIter::from_sorted_ids(
            vec![2, 3, 5],
            0,
            100,
            Direction::Forward,
        ));
        let text = set_string(&it);
        assert_eq!(text, "fixed:0-100:3:2,3,5");
        let mut back = parse_set(&text, &ctx).unwrap();
        assert_eq!(collect(&mut back, &ctx), vec![2, 3, 5]);
    }

    #[test]
    fn test_freeze_position_and_checksum() {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let mut it = Iter::Fixed(FixedIter::from_sorted_ids(
            vec![2, 3, 5],
            0,
            100,
            Direction::Forward,
        ));
        let mut b = Budget::unlimited();
        assert_eq!(it.next(&ctx, &mut b), Step::Emit(2));
        let cursor = freeze(&it, FreezeFlags::SET_POSITION, 1024);
        assert!(cursor.contains("/@2[cs:"));

        let mut back = thaw(&cursor, &ctx).unwrap();
        assert_eq!(collect(&mut back, &ctx), vec![3, 5]);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let it = Iter::Fixed(FixedIter::from_sorted_ids(
            vec![2],
            0,
            100,
            Direction::Forward,
        ));
        let cursor = freeze(&it, FreezeFlags::SET_POSITION, 1024);
        let bad = cursor.replace("fixed:0-100", "fixed:0-101");
        assert!(matches!(
            thaw(&bad, &ctx),
            Err(EngineError::Lexical { .. })
        ));
    }

    #[test]
    fn test_unknown_options_skipped() {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let mut it = parse_set("fixed:0-100:2:4,7[future:stuff][zz]", &ctx).unwrap();
        assert_eq!(collect(&mut it, &ctx), vec![4, 7]);
    }

    #[test]
    fn test_reserved_tokens_rejected() {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        assert!(matches!(
            parse_set("sort:0-10:", &ctx),
            Err(EngineError::Syntax(_))
        ));
        assert!(matches!(
            parse_set("prefix:0-10:", &ctx),
            Err(EngineError::Syntax(_))
        ));
    }

    #[test]
    fn test_gmap_round_trip_with_stats() {
        let mut store = MemStore::new();
        let t = store.add(PrimitiveSpec::default());
        let tg = store.guid_from_id(t).unwrap();
        for _ in 0..3 {
            store.add(PrimitiveSpec {
                typeguid: Some(tg),
                ..Default::default()
            });
        }
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let mut it = Iter::Link(LinkIter::new(
            &store,
            LinkSource::Gmap {
                linkage: Linkage::Typeguid,
                guid: tg,
            },
            0,
            100,
            Direction::Forward,
        ));
        let mut b = Budget::unlimited();
        let _ = it.statistics(&ctx, &mut b);
        let text = set_string(&it);
        assert!(text.starts_with("gmap:0-100:type:"));
        assert!(text.contains("[st:"));
        let back = parse_set(&text, &ctx).unwrap();
        // Statistics survive the trip (monotone validity).
        assert_eq!(back.stats().unwrap().n, 3);
    }

    #[test]
    fn test_backward_window_token() {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let it = parse_set("all:~5-25:", &ctx).unwrap();
        assert_eq!(it.direction(), Direction::Backward);
        assert_eq!((it.low(), it.high()), (5, 25));
        assert_eq!(set_string(&it), "all:~5-25:");
    }

    #[test]
    fn test_and_set_round_trip() {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let text = "and:0-100:2:(fixed:0-100:3:2,3,5)(fixed:0-100:2:3,5)";
        let mut it = parse_set(text, &ctx).unwrap();
        assert_eq!(collect(&mut it, &ctx), vec![3, 5]);
    }

    #[test]
    fn test_masquerade_materialises_recipe() {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let mut it = parse_set("fixed:0-100:*(or:0-100:2:(fixed:0-100:2:1,4)(fixed:0-100:1:4))", &ctx)
            .unwrap();
        assert_eq!(collect(&mut it, &ctx), vec![1, 4]);
        // The recipe, not the ids, is what freezes back out.
        assert!(set_string(&it).starts_with("fixed:0-100:*(or:"));
    }
}
