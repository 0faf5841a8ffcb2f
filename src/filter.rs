//! Rule engine adapter: hosts-style and adblock-style rules, exception and
//! rewrite handling, and the fallback-domain filter.

use std::fs;
use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::ResponseCode;
use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::config::FilterParams;

/// Filter id reported for rules of the compiled fallback-domain filter.
pub const FALLBACK_FILTER_ID: i32 = -1;

#[derive(Debug, Clone)]
pub struct Rule {
    pub text: String,
    pub filter_id: i32,
    pub content: RuleContent,
}

#[derive(Debug, Clone)]
pub enum RuleContent {
    /// Hosts-file line; the address is the answer for ADDRESS-style blocks.
    Hosts { address: IpAddr },
    Adblock {
        exception: bool,
        important: bool,
        rewrite: Option<Rewrite>,
    },
}

#[derive(Debug, Clone)]
pub enum Rewrite {
    Rcode(ResponseCode),
    Addr(IpAddr),
    Cname(String),
}

impl Rule {
    pub fn is_hosts(&self) -> bool {
        matches!(self.content, RuleContent::Hosts { .. })
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.content, RuleContent::Adblock { exception: true, .. })
    }

    pub fn is_important(&self) -> bool {
        matches!(self.content, RuleContent::Adblock { important: true, .. })
    }

    pub fn rewrite(&self) -> Option<&Rewrite> {
        match &self.content {
            RuleContent::Adblock { rewrite, .. } => rewrite.as_ref(),
            RuleContent::Hosts { .. } => None,
        }
    }

    pub fn hosts_address(&self) -> Option<IpAddr> {
        match &self.content {
            RuleContent::Hosts { address } => Some(*address),
            RuleContent::Adblock { .. } => None,
        }
    }
}

#[derive(Debug)]
enum Pattern {
    /// `||host^`: the host itself and any subdomain.
    Suffix(String),
    /// `|host^` or a hosts-file name: that host only.
    Exact(String),
    /// Un-anchored fragment.
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    fn matches(&self, domain: &str) -> bool {
        match self {
            Pattern::Suffix(host) => {
                domain == host
                    || (domain.len() > host.len()
                        && domain.ends_with(host.as_str())
                        && domain.as_bytes()[domain.len() - host.len() - 1] == b'.')
            }
            Pattern::Exact(host) => domain == host,
            Pattern::Substring(part) => domain.contains(part.as_str()),
            Pattern::Regex(re) => re.is_match(domain),
        }
    }

    /// Index key for the suffix-walk lookup, when one exists.
    fn index_key(&self) -> Option<&str> {
        match self {
            Pattern::Suffix(host) | Pattern::Exact(host) => Some(host.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    pattern: Pattern,
    rule: Arc<Rule>,
}

#[derive(Default, Debug)]
pub struct FilterEngine {
    rules: Vec<CompiledRule>,
    /// host -> rule indices, probed for the domain and each parent suffix.
    host_index: FxHashMap<String, Vec<usize>>,
    /// Rules that must be probed on every query (regex, substring).
    always_check: Vec<usize>,
}

impl FilterEngine {
    pub fn load(params: &FilterParams) -> Result<Self, String> {
        let mut engine = FilterEngine::default();
        for list in &params.filters {
            let text = match (&list.path, &list.rules) {
                (Some(path), _) => fs::read_to_string(path)
                    .map_err(|e| format!("filter list {}: {}", path, e))?,
                (None, Some(rules)) => rules.clone(),
                (None, None) => String::new(),
            };
            let mut discarded = 0usize;
            for line in text.lines() {
                if !engine.add_line(list.id, line) {
                    discarded += 1;
                }
            }
            if discarded > 0 {
                warn!(filter_id = list.id, discarded, "discarded unparsable filter rules");
            }
        }
        Ok(engine)
    }

    pub fn from_lines<'a>(filter_id: i32, lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut engine = FilterEngine::default();
        for line in lines {
            engine.add_line(filter_id, line);
        }
        engine
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns false for lines that held content but produced no rule.
    fn add_line(&mut self, filter_id: i32, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('#') {
            return true;
        }
        let parsed = parse_rule(filter_id, trimmed);
        if parsed.is_empty() {
            return false;
        }
        for (pattern, rule) in parsed {
            let idx = self.rules.len();
            match pattern.index_key() {
                Some(key) => self.host_index.entry(key.to_string()).or_default().push(idx),
                None => self.always_check.push(idx),
            }
            self.rules.push(CompiledRule { pattern, rule: Arc::new(rule) });
        }
        true
    }

    /// All rules matching `domain`, in rule-list order.
    pub fn match_domain(&self, domain: &str) -> Vec<Arc<Rule>> {
        let domain = domain.to_ascii_lowercase();
        let mut candidates: Vec<usize> = self.always_check.clone();

        let mut search = domain.as_str();
        loop {
            if let Some(indices) = self.host_index.get(search) {
                candidates.extend_from_slice(indices);
            }
            match search.find('.') {
                Some(idx) => search = &search[idx + 1..],
                None => break,
            }
        }

        candidates.sort_unstable();
        candidates.dedup();

        candidates
            .into_iter()
            .filter(|&i| self.rules[i].pattern.matches(&domain))
            .map(|i| self.rules[i].rule.clone())
            .collect()
    }
}

/// Matched rules split into the `$dnsrewrite` set and everything else, with
/// the governing leftover first.
pub struct EffectiveRules {
    pub dnsrewrite: Vec<Arc<Rule>>,
    pub leftovers: Vec<Arc<Rule>>,
}

impl EffectiveRules {
    /// True when the leftovers do not force a block: either nothing matched
    /// or the governing rule is an exception.
    pub fn leftovers_allow(&self) -> bool {
        match self.leftovers.first() {
            None => true,
            Some(rule) => rule.is_exception(),
        }
    }
}

fn leftover_priority(rule: &Rule) -> u8 {
    // $important outranks exception status; exception outranks plain block.
    (rule.is_important() as u8) << 1 | rule.is_exception() as u8
}

pub fn get_effective_rules(matched: Vec<Arc<Rule>>) -> EffectiveRules {
    let mut dnsrewrite = Vec::new();
    let mut rewrite_exception = false;
    let mut leftovers: Vec<Arc<Rule>> = Vec::new();

    for rule in matched {
        if rule.rewrite().is_some() {
            if rule.is_exception() {
                rewrite_exception = true;
            } else {
                dnsrewrite.push(rule);
            }
        } else {
            leftovers.push(rule);
        }
    }

    // An exception rewrite rule neutralizes every rewrite.
    if rewrite_exception {
        dnsrewrite.clear();
    }

    if let Some(best) = leftovers
        .iter()
        .enumerate()
        .max_by_key(|(i, r)| (leftover_priority(r), usize::MAX - i))
        .map(|(i, _)| i)
    {
        leftovers.swap(0, best);
    }

    EffectiveRules { dnsrewrite, leftovers }
}

/// Cumulative rewrite produced by applying `$dnsrewrite` rules in order.
#[derive(Debug, Default, Clone)]
pub struct RewriteInfo {
    pub rcode: Option<ResponseCode>,
    pub addresses: Vec<IpAddr>,
    pub cname: Option<String>,
}

pub fn apply_dnsrewrite(rules: &[Arc<Rule>]) -> (Vec<Arc<Rule>>, RewriteInfo) {
    let mut info = RewriteInfo::default();
    let mut used = Vec::new();
    for rule in rules {
        let Some(rewrite) = rule.rewrite() else { continue };
        match rewrite {
            Rewrite::Rcode(rcode) => info.rcode = Some(*rcode),
            Rewrite::Addr(addr) => info.addresses.push(*addr),
            Rewrite::Cname(name) => info.cname = Some(name.clone()),
        }
        used.push(rule.clone());
    }
    (used, info)
}

pub fn is_valid_rule(text: &str) -> bool {
    !parse_rule(0, text.trim()).is_empty()
}

fn parse_rcode(text: &str) -> Option<ResponseCode> {
    match text.to_ascii_uppercase().as_str() {
        "NOERROR" => Some(ResponseCode::NoError),
        "FORMERR" => Some(ResponseCode::FormErr),
        "SERVFAIL" => Some(ResponseCode::ServFail),
        "NXDOMAIN" => Some(ResponseCode::NXDomain),
        "NOTIMP" => Some(ResponseCode::NotImp),
        "REFUSED" => Some(ResponseCode::Refused),
        _ => None,
    }
}

fn parse_rewrite(value: &str) -> Option<Rewrite> {
    // Short form: an address, an rcode, or a CNAME target.
    // Full form: RCODE;RRTYPE;VALUE.
    let parts: Vec<&str> = value.split(';').collect();
    match parts.as_slice() {
        [single] => {
            if let Ok(addr) = single.parse::<IpAddr>() {
                Some(Rewrite::Addr(addr))
            } else if let Some(rcode) = parse_rcode(single) {
                Some(Rewrite::Rcode(rcode))
            } else if !single.is_empty() {
                Some(Rewrite::Cname(single.trim_end_matches('.').to_ascii_lowercase()))
            } else {
                None
            }
        }
        [rcode, rrtype, value] => {
            let rcode = parse_rcode(rcode)?;
            if rcode != ResponseCode::NoError {
                return Some(Rewrite::Rcode(rcode));
            }
            match rrtype.to_ascii_uppercase().as_str() {
                "A" | "AAAA" => value.parse::<IpAddr>().ok().map(Rewrite::Addr),
                "CNAME" => {
                    Some(Rewrite::Cname(value.trim_end_matches('.').to_ascii_lowercase()))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => out.push(c),
            '.' => out.push_str("\\."),
            _ => return None,
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

/// Parse one non-comment line. Hosts lines can fan out into several rules,
/// one per hostname.
fn parse_rule(filter_id: i32, line: &str) -> Vec<(Pattern, Rule)> {
    // Regex rule form.
    if line.len() > 2 && line.starts_with('/') && line.ends_with('/') {
        let Ok(re) = Regex::new(&line[1..line.len() - 1]) else {
            return Vec::new();
        };
        let rule = Rule {
            text: line.to_string(),
            filter_id,
            content: RuleContent::Adblock { exception: false, important: false, rewrite: None },
        };
        return vec![(Pattern::Regex(re), rule)];
    }

    // Hosts-file form: "<address> <name> [<name> ...]".
    let mut tokens = line.split_whitespace();
    if let Some(first) = tokens.next() {
        if let Ok(address) = first.parse::<IpAddr>() {
            let mut out = Vec::new();
            for name in tokens {
                let name = name.to_ascii_lowercase();
                if name.is_empty() {
                    continue;
                }
                out.push((
                    Pattern::Exact(name),
                    Rule {
                        text: line.to_string(),
                        filter_id,
                        content: RuleContent::Hosts { address },
                    },
                ));
            }
            return out;
        }
    }

    // Adblock form.
    let mut body = line;
    let mut exception = false;
    if let Some(rest) = body.strip_prefix("@@") {
        exception = true;
        body = rest;
    }

    let mut important = false;
    let mut rewrite = None;
    if let Some(dollar) = body.find('$') {
        let modifiers = &body[dollar + 1..];
        body = &body[..dollar];
        for modifier in modifiers.split(',') {
            if modifier == "important" {
                important = true;
            } else if let Some(value) = modifier.strip_prefix("dnsrewrite=") {
                match parse_rewrite(value) {
                    Some(r) => rewrite = Some(r),
                    None => return Vec::new(),
                }
            } else {
                // Unsupported modifier: refuse rather than silently mis-filter.
                return Vec::new();
            }
        }
    }

    let mut host = body;
    let suffix_anchor = if let Some(rest) = host.strip_prefix("||") {
        host = rest;
        true
    } else {
        false
    };
    let exact_anchor = if let Some(rest) = host.strip_prefix('|') {
        host = rest;
        true
    } else {
        false
    };
    host = host.strip_suffix('^').unwrap_or(host);
    let host = host.to_ascii_lowercase();
    if host.is_empty() {
        return Vec::new();
    }

    let pattern = if host.contains('*') {
        match wildcard_regex(&host) {
            Some(re) => Pattern::Regex(re),
            None => return Vec::new(),
        }
    } else if suffix_anchor {
        Pattern::Suffix(host)
    } else if exact_anchor {
        Pattern::Exact(host)
    } else {
        Pattern::Substring(host)
    };

    let rule = Rule {
        text: line.to_string(),
        filter_id,
        content: RuleContent::Adblock { exception, important, rewrite },
    };
    vec![(pattern, rule)]
}

const FALLBACK_PATTERN_CHARSET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-.*";

/// Compile `fallback_domains` patterns into a filter: `|pattern^` rules,
/// wildcards allowed anywhere but the tail. The fallback filter must
/// compile cleanly, so any unusable pattern fails the whole set.
pub fn compile_fallback_filter(patterns: &[String]) -> Result<FilterEngine, String> {
    let mut engine = FilterEngine::default();
    for pattern in patterns {
        let p = pattern.trim();
        if p.is_empty() {
            continue;
        }
        if let Some(pos) = p.find(|c| !FALLBACK_PATTERN_CHARSET.contains(c)) {
            return Err(format!("bad character at offset {pos} in fallback pattern '{pattern}'"));
        }
        if let Some(wldpos) = p.rfind('*') {
            if wldpos == p.len() - 1 {
                return Err(format!("wildcard at the end of fallback pattern '{pattern}'"));
            }
        }
        let mut rule = String::with_capacity(p.len() + 2);
        if !p.starts_with('*') {
            rule.push('|');
        }
        rule.push_str(p);
        rule.push('^');

        if !is_valid_rule(&rule) {
            return Err(format!("fallback pattern '{pattern}' compiles to an invalid rule"));
        }
        engine.add_line(FALLBACK_FILTER_ID, &rule);
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_rule_matches_host_and_subdomains() {
        let engine = FilterEngine::from_lines(1, ["||ads.example^"]);
        assert_eq!(engine.match_domain("ads.example").len(), 1);
        assert_eq!(engine.match_domain("sub.ads.example").len(), 1);
        assert!(engine.match_domain("badads.example").is_empty());
        assert!(engine.match_domain("example").is_empty());
    }

    #[test]
    fn exact_rule_matches_only_that_host() {
        let engine = FilterEngine::from_lines(1, ["|fritz.box^"]);
        assert_eq!(engine.match_domain("fritz.box").len(), 1);
        assert!(engine.match_domain("sub.fritz.box").is_empty());
    }

    #[test]
    fn hosts_line_fans_out_per_name() {
        let engine = FilterEngine::from_lines(2, ["0.0.0.0 tracker.bad telemetry.bad"]);
        let matched = engine.match_domain("telemetry.bad");
        assert_eq!(matched.len(), 1);
        assert!(matched[0].is_hosts());
        assert_eq!(matched[0].hosts_address(), Some("0.0.0.0".parse().unwrap()));
        assert_eq!(engine.match_domain("tracker.bad").len(), 1);
    }

    #[test]
    fn exception_governs_over_plain_block() {
        let engine = FilterEngine::from_lines(1, ["||example.com^", "@@||good.example.com^"]);
        let effective = get_effective_rules(engine.match_domain("good.example.com"));
        assert!(effective.leftovers_allow());
        assert!(effective.leftovers[0].is_exception());
    }

    #[test]
    fn important_block_beats_exception() {
        let engine =
            FilterEngine::from_lines(1, ["||example.com^$important", "@@||example.com^"]);
        let effective = get_effective_rules(engine.match_domain("example.com"));
        assert!(!effective.leftovers_allow());
        assert!(effective.leftovers[0].is_important());
    }

    #[test]
    fn no_match_allows() {
        let engine = FilterEngine::from_lines(1, ["||ads.example^"]);
        let effective = get_effective_rules(engine.match_domain("clean.example"));
        assert!(effective.leftovers_allow());
        assert!(effective.dnsrewrite.is_empty());
    }

    #[test]
    fn dnsrewrite_short_forms() {
        let engine = FilterEngine::from_lines(
            1,
            [
                "||a.example^$dnsrewrite=1.2.3.4",
                "||b.example^$dnsrewrite=REFUSED",
                "||c.example^$dnsrewrite=target.example",
            ],
        );

        let eff = get_effective_rules(engine.match_domain("a.example"));
        let (used, info) = apply_dnsrewrite(&eff.dnsrewrite);
        assert_eq!(used.len(), 1);
        assert_eq!(info.addresses, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);

        let eff = get_effective_rules(engine.match_domain("b.example"));
        let (_, info) = apply_dnsrewrite(&eff.dnsrewrite);
        assert_eq!(info.rcode, Some(ResponseCode::Refused));

        let eff = get_effective_rules(engine.match_domain("c.example"));
        let (_, info) = apply_dnsrewrite(&eff.dnsrewrite);
        assert_eq!(info.cname.as_deref(), Some("target.example"));
    }

    #[test]
    fn dnsrewrite_full_form() {
        let engine =
            FilterEngine::from_lines(1, ["||a.example^$dnsrewrite=NOERROR;AAAA;64:ff9b::1"]);
        let eff = get_effective_rules(engine.match_domain("a.example"));
        let (_, info) = apply_dnsrewrite(&eff.dnsrewrite);
        assert_eq!(info.addresses, vec!["64:ff9b::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn exception_rewrite_neutralizes_rewrites() {
        let engine = FilterEngine::from_lines(
            1,
            ["||a.example^$dnsrewrite=1.2.3.4", "@@||a.example^$dnsrewrite=1.2.3.4"],
        );
        let eff = get_effective_rules(engine.match_domain("a.example"));
        assert!(eff.dnsrewrite.is_empty());
    }

    #[test]
    fn regex_rule_matches() {
        let engine = FilterEngine::from_lines(1, ["/^ads[0-9]+\\./"]);
        assert_eq!(engine.match_domain("ads12.example").len(), 1);
        assert!(engine.match_domain("ads.example").is_empty());
    }

    #[test]
    fn unsupported_modifier_is_invalid() {
        assert!(!is_valid_rule("||x.example^$denyallow=example.org"));
        assert!(is_valid_rule("||x.example^$important"));
    }

    #[test]
    fn fallback_filter_compiles_patterns() {
        let patterns: Vec<String> = ["*.local", "fritz.box", "epdg.epc.*.pub.3gppnetwork.org"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let engine = compile_fallback_filter(&patterns).expect("compile");
        assert_eq!(engine.match_domain("host.local").len(), 1);
        assert_eq!(engine.match_domain("fritz.box").len(), 1);
        assert!(engine.match_domain("sub.fritz.box").is_empty());
        assert_eq!(engine.match_domain("epdg.epc.mnc001.pub.3gppnetwork.org").len(), 1);
        assert!(engine.match_domain("unrelated.example").is_empty());
    }

    #[test]
    fn fallback_filter_rejects_bad_patterns() {
        for bad in ["trailing.wildcard.*", "bad char"] {
            let patterns = vec![bad.to_string(), "ok.example".to_string()];
            let err = compile_fallback_filter(&patterns).unwrap_err();
            assert!(err.contains(bad), "error should name the pattern: {err}");
        }
    }

    #[test]
    fn fallback_filter_ignores_blank_patterns() {
        let patterns = vec!["  ".to_string(), "ok.example".to_string()];
        let engine = compile_fallback_filter(&patterns).expect("compile");
        assert_eq!(engine.match_domain("ok.example").len(), 1);
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let engine = FilterEngine::from_lines(1, ["! comment", "# comment", "", "||x.example^"]);
        assert_eq!(engine.match_domain("x.example").len(), 1);
        assert!(engine.is_empty() == false);
    }
}
