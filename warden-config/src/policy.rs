//! The loaded policy snapshot: user/host groups, authority chains, access
//! security groups and their rules.
//!
//! A [`SecurityBase`] is built once per load by the parser and then treated
//! as immutable except for the per rule calc results and the per group input
//! state, both owned by the evaluating engine. Group tables are kept in
//! lexical order by name, matching the dump format.

use std::collections::HashSet;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};

use warden_api_types::{AccessRights, Error, Protocol, DEFAULT_GROUP, MAX_AUTH_CHAIN};
use warden_calc::{CalcProgram, MAX_ARGS};

use crate::parser::PolicyParser;

/// A named set of user names.
pub struct Uag {
    pub name: String,
    /// Declaration order, for the dump.
    pub entries: Vec<String>,
    lookup: HashSet<String>,
}

/// A named set of host names, stored either lower-cased or resolved to
/// dotted-quad addresses depending on the snapshot's `use_client_ip` flag.
pub struct Hag {
    pub name: String,
    pub entries: Vec<String>,
    lookup: HashSet<String>,
}

/// A named chain of certificate common names, newline separated, ordered
/// from the trust anchor down to the issuer.
pub struct AuthorityChain {
    pub name: String,
    pub chain: String,
}

/// Compiled rule condition.
pub struct RuleCalc {
    pub source: String,
    pub program: CalcProgram,
    /// Bitmap of group inputs the expression references.
    pub inp_used: u32,
}

pub struct Rule {
    pub access: AccessRights,
    pub level: i32,
    pub trap: bool,
    pub protocol: Option<Protocol>,
    pub uags: Vec<String>,
    pub hags: Vec<String>,
    pub methods: Vec<String>,
    pub authorities: Vec<String>,
    pub calc: Option<RuleCalc>,
    /// Last boolean result of the calc condition.
    pub result: bool,
    /// Set by the parser when the rule contains constructs the engine knows
    /// it cannot satisfy; ignored rules never match and are not dumped.
    pub ignore: bool,
    /// Latch so a failing calc is only reported once.
    pub warned: bool,
}

impl Rule {
    pub fn new(access: AccessRights, level: i32) -> Self {
        Self {
            access,
            level,
            trap: false,
            protocol: None,
            uags: Vec::new(),
            hags: Vec::new(),
            methods: Vec::new(),
            authorities: Vec::new(),
            calc: None,
            result: false,
            ignore: false,
            warned: false,
        }
    }
}

pub struct AsgInput {
    pub source: String,
    pub index: usize,
}

/// Access security group: an ordered rule list plus the live numeric inputs
/// its calc conditions refer to.
pub struct Asg {
    pub name: String,
    pub inputs: Vec<AsgInput>,
    pub rules: Vec<Rule>,
    pub values: [f64; MAX_ARGS],
    pub inp_bad: u32,
    pub inp_changed: u32,
    /// Attachment slots of the members currently bound to this group,
    /// managed by the engine.
    pub members: Vec<usize>,
}

impl Asg {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inputs: Vec::new(),
            rules: Vec::new(),
            values: [0.0; MAX_ARGS],
            inp_bad: 0,
            inp_changed: 0,
            members: Vec::new(),
        }
    }
}

/// How much detail the dump writers include.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum DumpStyle {
    /// The round-trippable normalized form.
    Plain,
    /// Adds input validity/values and calc results.
    Verbose,
    /// The per-group rules listing: like `Verbose`, but input values are
    /// shown unconditionally and validity only when bad.
    Rules,
}

/// One loaded policy snapshot.
pub struct SecurityBase {
    pub uags: Vec<Uag>,
    pub hags: Vec<Hag>,
    pub authorities: Vec<AuthorityChain>,
    pub asgs: Vec<Asg>,
    pub use_client_ip: bool,
}

impl SecurityBase {
    /// A new snapshot holding only the empty `DEFAULT` group.
    pub fn new(use_client_ip: bool) -> Self {
        let mut base = Self {
            uags: Vec::new(),
            hags: Vec::new(),
            authorities: Vec::new(),
            asgs: Vec::new(),
            use_client_ip,
        };
        base.asg_add(DEFAULT_GROUP).expect("empty snapshot");
        base
    }

    /// Parse policy text into a fresh snapshot.
    pub fn from_raw(text: &str, use_client_ip: bool) -> Result<Self, Error> {
        let mut base = Self::new(use_client_ip);
        PolicyParser::parse(text, &mut base)?;
        Ok(base)
    }

    pub fn uag_add(&mut self, name: &str) -> Result<usize, Error> {
        match self.uags.binary_search_by(|uag| uag.name.as_str().cmp(name)) {
            Ok(_) => Err(Error::BadConfig(format!(
                "duplicate user access group named '{}'",
                name
            ))),
            Err(pos) => {
                self.uags.insert(
                    pos,
                    Uag {
                        name: name.to_string(),
                        entries: Vec::new(),
                        lookup: HashSet::new(),
                    },
                );
                Ok(pos)
            }
        }
    }

    pub fn uag_add_user(&mut self, uag: usize, user: String) {
        let uag = &mut self.uags[uag];
        if !uag.lookup.insert(user.clone()) {
            log::warn!("duplicate user '{}' in UAG '{}'", user, uag.name);
            return;
        }
        uag.entries.push(user);
    }

    pub fn uag_exists(&self, name: &str) -> bool {
        self.uags
            .binary_search_by(|uag| uag.name.as_str().cmp(name))
            .is_ok()
    }

    /// Membership test backing the evaluator's UAG predicate.
    pub fn uag_member(&self, name: &str, user: &str) -> bool {
        match self.uags.binary_search_by(|uag| uag.name.as_str().cmp(name)) {
            Ok(pos) => self.uags[pos].lookup.contains(user),
            Err(_) => false,
        }
    }

    pub fn hag_add(&mut self, name: &str) -> Result<usize, Error> {
        match self.hags.binary_search_by(|hag| hag.name.as_str().cmp(name)) {
            Ok(_) => Err(Error::BadConfig(format!(
                "duplicate host access group named '{}'",
                name
            ))),
            Err(pos) => {
                self.hags.insert(
                    pos,
                    Hag {
                        name: name.to_string(),
                        entries: Vec::new(),
                        lookup: HashSet::new(),
                    },
                );
                Ok(pos)
            }
        }
    }

    /// Store a host either as the lower-cased literal or, with
    /// `use_client_ip`, resolved to its dotted-quad address. Unresolvable
    /// hosts are kept with an `unresolved:` prefix so they match nothing.
    pub fn hag_add_host(&mut self, hag: usize, host: &str) {
        let stored = if !self.use_client_ip {
            host.to_ascii_lowercase()
        } else {
            match resolve_host(host) {
                Some(addr) => addr.to_string(),
                None => {
                    log::warn!("unable to resolve host '{}'", host);
                    format!("unresolved:{}", host)
                }
            }
        };
        let hag = &mut self.hags[hag];
        if !hag.lookup.insert(stored.clone()) {
            log::warn!("duplicate host '{}' in HAG '{}'", stored, hag.name);
            return;
        }
        hag.entries.push(stored);
    }

    pub fn hag_exists(&self, name: &str) -> bool {
        self.hags
            .binary_search_by(|hag| hag.name.as_str().cmp(name))
            .is_ok()
    }

    /// Membership test backing the evaluator's HAG predicate.
    pub fn hag_member(&self, name: &str, host: &str) -> bool {
        match self.hags.binary_search_by(|hag| hag.name.as_str().cmp(name)) {
            Ok(pos) => self.hags[pos].lookup.contains(host),
            Err(_) => false,
        }
    }

    /// Register a named authority chain. Chains are capped at
    /// [`MAX_AUTH_CHAIN`] bytes and truncated (on a char boundary) on
    /// intake, matching the bound on client supplied chains.
    pub fn authority_add(&mut self, name: &str, chain: &str) -> Result<(), Error> {
        match self
            .authorities
            .binary_search_by(|auth| auth.name.as_str().cmp(name))
        {
            Ok(_) => Err(Error::BadConfig(format!(
                "duplicate certificate authority named '{}'",
                name
            ))),
            Err(pos) => {
                let mut chain = chain.to_string();
                if chain.len() > MAX_AUTH_CHAIN {
                    log::warn!(
                        "authority chain for '{}' exceeds {} bytes, truncated",
                        name,
                        MAX_AUTH_CHAIN
                    );
                    let mut end = MAX_AUTH_CHAIN;
                    while !chain.is_char_boundary(end) {
                        end -= 1;
                    }
                    chain.truncate(end);
                }
                self.authorities.insert(
                    pos,
                    AuthorityChain {
                        name: name.to_string(),
                        chain,
                    },
                );
                Ok(())
            }
        }
    }

    /// Look up the stored chain for a named authority. Rules hold authority
    /// names unresolved; a name that never got defined simply yields `None`
    /// at evaluation time.
    pub fn authority_chain(&self, name: &str) -> Option<&str> {
        match self
            .authorities
            .binary_search_by(|auth| auth.name.as_str().cmp(name))
        {
            Ok(pos) => Some(&self.authorities[pos].chain),
            Err(_) => None,
        }
    }

    /// Add an access security group. A duplicate `DEFAULT` is merged into
    /// the seeded one as long as that is still empty; any other duplicate is
    /// an error.
    pub fn asg_add(&mut self, name: &str) -> Result<usize, Error> {
        match self.asgs.binary_search_by(|asg| asg.name.as_str().cmp(name)) {
            Ok(pos) => {
                let asg = &self.asgs[pos];
                if name == DEFAULT_GROUP && asg.inputs.is_empty() && asg.rules.is_empty() {
                    return Ok(pos);
                }
                Err(Error::DupAsg(name.to_string()))
            }
            Err(pos) => {
                self.asgs.insert(pos, Asg::new(name));
                Ok(pos)
            }
        }
    }

    pub fn asg_add_input(&mut self, asg: usize, index: usize, source: String) {
        self.asgs[asg].inputs.push(AsgInput { source, index });
    }

    pub fn find_asg(&self, name: &str) -> Option<usize> {
        self.asgs
            .binary_search_by(|asg| asg.name.as_str().cmp(name))
            .ok()
    }

    pub fn write_uags(&self, w: &mut dyn Write, filter: Option<&str>) -> Result<(), anyhow::Error> {
        if self.uags.is_empty() {
            writeln!(w, "No UAGs")?;
        }
        for uag in &self.uags {
            if matches!(filter, Some(name) if name != uag.name) {
                continue;
            }
            write!(w, "UAG({})", uag.name)?;
            if uag.entries.is_empty() {
                writeln!(w)?;
            } else {
                writeln!(w, " {{{}}}", uag.entries.join(","))?;
            }
        }
        Ok(())
    }

    pub fn write_hags(&self, w: &mut dyn Write, filter: Option<&str>) -> Result<(), anyhow::Error> {
        for hag in &self.hags {
            if matches!(filter, Some(name) if name != hag.name) {
                continue;
            }
            write!(w, "HAG({})", hag.name)?;
            if hag.entries.is_empty() {
                writeln!(w)?;
            } else {
                writeln!(w, " {{{}}}", hag.entries.join(","))?;
            }
        }
        Ok(())
    }

    pub fn write_authorities(&self, w: &mut dyn Write) -> Result<(), anyhow::Error> {
        for auth in &self.authorities {
            let pretty = auth.chain.split('\n').collect::<Vec<_>>().join(" -> ");
            writeln!(w, "AUTHORITY({}: {})", auth.name, pretty)?;
        }
        Ok(())
    }

    /// Round-trippable pretty-print of the snapshot.
    pub fn write_config(&self, w: &mut dyn Write, style: DumpStyle) -> Result<(), anyhow::Error> {
        self.write_uags(w, None)?;
        self.write_hags(w, None)?;
        self.write_authorities(w)?;
        if self.asgs.is_empty() {
            writeln!(w, "No ASGs")?;
        }
        for asg in &self.asgs {
            let brace = self.write_asg_open(w, asg, style)?;
            if brace {
                writeln!(w, "}}")?;
            }
        }
        Ok(())
    }

    /// The per-group rules listing.
    pub fn write_rules(&self, w: &mut dyn Write, filter: Option<&str>) -> Result<(), anyhow::Error> {
        if self.asgs.is_empty() {
            writeln!(w, "No ASGs")?;
        }
        for asg in &self.asgs {
            if matches!(filter, Some(name) if name != asg.name) {
                continue;
            }
            let brace = self.write_asg_open(w, asg, DumpStyle::Rules)?;
            if brace {
                writeln!(w, "}}")?;
            }
        }
        Ok(())
    }

    /// Write one `ASG(...)` block without its closing brace, so the engine
    /// can append member information. Returns whether a brace was opened.
    pub fn write_asg_open(
        &self,
        w: &mut dyn Write,
        asg: &Asg,
        style: DumpStyle,
    ) -> Result<bool, anyhow::Error> {
        write!(w, "ASG({})", asg.name)?;
        let brace = !asg.inputs.is_empty() || !asg.rules.is_empty();
        if brace {
            writeln!(w, " {{")?;
        } else {
            writeln!(w)?;
        }
        for input in &asg.inputs {
            write!(w, "\tINP{}({})", (b'A' + input.index as u8) as char, input.source)?;
            let bad = (asg.inp_bad & (1 << input.index)) != 0;
            match style {
                DumpStyle::Plain => {}
                DumpStyle::Verbose => {
                    write!(w, "{}", if bad { " INVALID" } else { "   VALID" })?;
                    write!(w, " value={:.6}", asg.values[input.index])?;
                }
                DumpStyle::Rules => {
                    if bad {
                        write!(w, " INVALID")?;
                    }
                    write!(w, " value={:.6}", asg.values[input.index])?;
                }
            }
            writeln!(w)?;
        }
        for rule in &asg.rules {
            if rule.ignore {
                continue;
            }
            self.write_rule(w, rule, style)?;
        }
        Ok(brace)
    }

    fn write_rule(&self, w: &mut dyn Write, rule: &Rule, style: DumpStyle) -> Result<(), anyhow::Error> {
        write!(
            w,
            "\tRULE({},{},{})",
            rule.level,
            rule.access,
            if rule.trap { "TRAPWRITE" } else { "NOTRAPWRITE" }
        )?;
        let brace = !rule.uags.is_empty()
            || !rule.hags.is_empty()
            || !rule.methods.is_empty()
            || !rule.authorities.is_empty()
            || rule.calc.is_some()
            || rule.protocol.is_some();
        if !brace {
            writeln!(w)?;
            return Ok(());
        }
        writeln!(w, " {{")?;
        if !rule.uags.is_empty() {
            writeln!(w, "\t\tUAG({})", rule.uags.join(","))?;
        }
        if !rule.hags.is_empty() {
            writeln!(w, "\t\tHAG({})", rule.hags.join(","))?;
        }
        if !rule.methods.is_empty() {
            let list: Vec<String> = rule.methods.iter().map(|m| format!("\"{}\"", m)).collect();
            writeln!(w, "\t\tMETHOD({})", list.join(","))?;
        }
        if !rule.authorities.is_empty() {
            writeln!(w, "\t\tAUTHORITY({})", rule.authorities.join(","))?;
        }
        if let Some(calc) = &rule.calc {
            write!(w, "\t\tCALC(\"{}\")", calc.source)?;
            if style != DumpStyle::Plain {
                write!(w, " result={}", if rule.result { "TRUE" } else { "FALSE" })?;
            }
            writeln!(w)?;
        }
        if let Some(protocol) = rule.protocol {
            writeln!(w, "\t\tPROTOCOL(\"{}\")", protocol)?;
        }
        writeln!(w, "\t}}")?;
        Ok(())
    }
}

fn resolve_host(host: &str) -> Option<std::net::Ipv4Addr> {
    let addrs = (host, 0u16).to_socket_addrs().ok()?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Some(*v4.ip());
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::{DumpStyle, SecurityBase};
    use warden_api_types::Error;

    const METHOD_AUTH_CONFIG: &str = "\
UAG(bar) {boss}
UAG(foo) {testing}
UAG(ops) {geek}

AUTHORITY(AUTH_LAB_ROOT, \"Lab Org Root CA\") {
	AUTHORITY(AUTH_INTERMEDIATE_CA, \"Intermediate CA\") {
		AUTHORITY(AUTH_CTRL_CA, \"Controls Org CA\")
	}
	AUTHORITY(AUTH_UNRELATED_CA, \"Unrelated CA\")
}

ASG(DEFAULT) {
	RULE(0, NONE)
}

ASG(ro) {
	RULE(0, NONE)
	RULE(1, READ) {
		UAG(foo,ops)
		METHOD(\"ca\")
		PROTOCOL(\"TCP\")
	}
}

ASG(rw) {
	RULE(0, NONE)
	RULE(1, WRITE, TRAPWRITE) {
		UAG(foo)
		METHOD(\"x509\")
		AUTHORITY(AUTH_UNRELATED_CA)
	}
}

ASG(rwx) {
	RULE(0, NONE)
	RULE(1, RPC) {
		UAG(bar)
		METHOD(\"x509\",\"ignored\",\"ignored_too\")
		AUTHORITY(AUTH_UNRELATED_CA, AUTH_CTRL_CA)
		PROTOCOL(\"TLS\")
	}
}
";

    const EXPECTED_METHOD_AUTH_DUMP: &str = "\
UAG(bar) {boss}
UAG(foo) {testing}
UAG(ops) {geek}
AUTHORITY(AUTH_CTRL_CA: Lab Org Root CA -> Intermediate CA -> Controls Org CA)
AUTHORITY(AUTH_INTERMEDIATE_CA: Lab Org Root CA -> Intermediate CA)
AUTHORITY(AUTH_LAB_ROOT: Lab Org Root CA)
AUTHORITY(AUTH_UNRELATED_CA: Lab Org Root CA -> Unrelated CA)
ASG(DEFAULT) {
	RULE(0,NONE,NOTRAPWRITE)
}
ASG(ro) {
	RULE(0,NONE,NOTRAPWRITE)
	RULE(1,READ,NOTRAPWRITE) {
		UAG(foo,ops)
		METHOD(\"ca\")
		PROTOCOL(\"tcp\")
	}
}
ASG(rw) {
	RULE(0,NONE,NOTRAPWRITE)
	RULE(1,WRITE,TRAPWRITE) {
		UAG(foo)
		METHOD(\"x509\")
		AUTHORITY(AUTH_UNRELATED_CA)
	}
}
ASG(rwx) {
	RULE(0,NONE,NOTRAPWRITE)
	RULE(1,RPC,NOTRAPWRITE) {
		UAG(bar)
		METHOD(\"x509\",\"ignored\",\"ignored_too\")
		AUTHORITY(AUTH_UNRELATED_CA,AUTH_CTRL_CA)
		PROTOCOL(\"tls\")
	}
}
";

    fn dump(base: &SecurityBase) -> String {
        let mut raw: Vec<u8> = Vec::new();
        base.write_config(&mut raw, DumpStyle::Plain)
            .expect("failed to write policy dump");
        String::from_utf8(raw).expect("dump is not valid utf8")
    }

    fn dump_rules(base: &SecurityBase, name: &str) -> String {
        let mut raw: Vec<u8> = Vec::new();
        base.write_rules(&mut raw, Some(name))
            .expect("failed to write rules dump");
        String::from_utf8(raw).expect("dump is not valid utf8")
    }

    #[test]
    fn test_dump_normalized() {
        let base = SecurityBase::from_raw(METHOD_AUTH_CONFIG, false)
            .expect("failed to parse policy");
        assert_eq!(dump(&base), EXPECTED_METHOD_AUTH_DUMP);
    }

    #[test]
    fn test_dump_rules_filtered() {
        let base = SecurityBase::from_raw(METHOD_AUTH_CONFIG, false)
            .expect("failed to parse policy");
        assert_eq!(
            dump_rules(&base, "DEFAULT"),
            "ASG(DEFAULT) {\n\tRULE(0,NONE,NOTRAPWRITE)\n}\n"
        );
        assert_eq!(
            dump_rules(&base, "rw"),
            "\
ASG(rw) {
	RULE(0,NONE,NOTRAPWRITE)
	RULE(1,WRITE,TRAPWRITE) {
		UAG(foo)
		METHOD(\"x509\")
		AUTHORITY(AUTH_UNRELATED_CA)
	}
}
"
        );
        // unknown group names select nothing
        assert_eq!(dump_rules(&base, "nope"), "");
    }

    #[test]
    fn test_dump_round_trip() {
        // authority chains dump in their pretty form, which is not policy
        // syntax; everything else round-trips through the parser
        let config = "\
UAG(eng) {alice, bob}
HAG(gw) {CTRL-GW01, 127.0.0.1}
ASG(limits) {
	INPA(temperature)
	RULE(0, NONE)
	RULE(1, WRITE, TRAPWRITE) {
		UAG(eng)
		HAG(gw)
		CALC(\"A<50\")
	}
}
";
        let base = SecurityBase::from_raw(config, false).expect("failed to parse policy");
        let first = dump(&base);
        let reparsed = SecurityBase::from_raw(&first, false).expect("failed to reparse dump");
        assert_eq!(dump(&reparsed), first);
        // hosts are stored lower-cased
        assert!(first.contains("HAG(gw) {ctrl-gw01,127.0.0.1}"));
    }

    #[test]
    fn test_empty_config_rejected() {
        let err = SecurityBase::from_raw("\n#almost empty file\n\n", false).unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)), "got {:?}", err);
        assert_eq!(err.code(), 6);
    }

    #[test]
    fn test_duplicate_method_and_authority() {
        let err = SecurityBase::from_raw(
            "ASG(foo) {RULE(0, NONE) {METHOD(\"x509\") METHOD(\"x509\")}}",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DupMethod(_)), "got {:?}", err);

        let err = SecurityBase::from_raw(
            "ASG(foo) {RULE(0, NONE) {AUTHORITY(\"Org Root CA\") AUTHORITY(\"Org Root CA\")}}",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DupAuthority(_)), "got {:?}", err);

        // the same method in two different rules is fine
        SecurityBase::from_raw(
            "ASG(foo) {RULE(0, NONE) {METHOD(\"x509\")} RULE(1, RPC) {METHOD(\"x509\")}}",
            false,
        )
        .expect("methods may repeat across rules");

        SecurityBase::from_raw(
            "ASG(foo) {RULE(0, NONE) {METHOD(\"x509\") METHOD(\"ca\")}}",
            false,
        )
        .expect("distinct methods in one rule are fine");
    }

    #[test]
    fn test_duplicate_groups() {
        assert!(SecurityBase::from_raw("UAG(a) {x}\nUAG(a) {y}", false).is_err());
        assert!(SecurityBase::from_raw("HAG(a) {x}\nHAG(a) {y}", false).is_err());
        let err =
            SecurityBase::from_raw("ASG(a) {RULE(0, NONE)}\nASG(a) {RULE(0, NONE)}", false)
                .unwrap_err();
        assert!(matches!(err, Error::DupAsg(_)), "got {:?}", err);

        // an empty DEFAULT may be re-declared once with content
        SecurityBase::from_raw("ASG(DEFAULT) {RULE(0, NONE)}", false)
            .expect("merging into the seeded DEFAULT");
        let err = SecurityBase::from_raw(
            "ASG(DEFAULT) {RULE(0, NONE)}\nASG(DEFAULT) {RULE(0, READ)}",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DupAsg(_)), "got {:?}", err);
    }

    #[test]
    fn test_future_proof_accepted() {
        let accepted = [
            "GENERIC(WELL, FORMED, ARG, LIST)\nASG(ro) {RULE(0, READ)}",
            "SIMPLE(WELL, FORMED) {\n\tWELL, FORMED, LIST\n}\nASG(ro) {RULE(0, READ)}",
            "COMPLEX(1, WELL, \"FORMED\") {\n\tALSO_GENERIC(ARG, 2.0)\n}\nASG(ro) {RULE(0, READ)}",
            "SUB_BLOCKS(1.0, ARGS) {\n\tA_GENERIC() {\n\t\tAND_LIST_BODY\n\t}\n\tB_GENERIC() {\n\t\tBIGGER, LIST, BODY\n\t}\n}\nASG(ro) {RULE(0, READ)}",
            "RECURSIVE(1.0, -2.3, +4.5, ARGS, +2.71828E-23, -2.71828e+23, +12, -13, +-14) {\n\tX() {\n\t\tY(FOO) {\n\t\t\tLIST, BODY\n\t\t}\n\t}\n}\nASG(ro) {RULE(+1, READ)}",
            // keywords lose their meaning inside unknown declarations
            "WITH_KEYWORDS(UAG) {\n\tASG(HAL, IMP, CALC, RULE)\n\tHAL(USG, METHOD) {\n\t\tPROTOCOL(\"TLS\", AUTHORITY)\n\t}\n}\nASG(ro) {RULE(0, READ)}",
        ];
        for config in accepted {
            SecurityBase::from_raw(config, false)
                .unwrap_or_else(|err| panic!("'{}' should parse: {}", config, err));
        }
    }

    #[test]
    fn test_future_proof_taints_rules() {
        let base = SecurityBase::from_raw(
            "HAG(foo) {localhost}\nASG(ro) {RULE(0, NONE) RULE(1, READ) {HAG(foo) GROUP(\"x\")}}",
            false,
        )
        .expect("unknown predicate must not fail the load");
        let asg = &base.asgs[base.find_asg("ro").unwrap()];
        assert!(!asg.rules[0].ignore);
        assert!(asg.rules[1].ignore);

        // unknown permission name
        let base = SecurityBase::from_raw(
            "ASG(ro) {RULE(1, ADDITIONAL_PERMISSION) {}}",
            false,
        )
        .expect("unknown permission must not fail the load");
        assert!(base.asgs[base.find_asg("ro").unwrap()].rules[0].ignore);

        // unknown protocol value
        let base = SecurityBase::from_raw(
            "ASG(ro) {RULE(1, WRITE) {PROTOCOL(UNKNOWN_PROTOCOL)}}",
            false,
        )
        .expect("unknown protocol must not fail the load");
        assert!(base.asgs[base.find_asg("ro").unwrap()].rules[0].ignore);

        // reference to an undefined group
        let base = SecurityBase::from_raw(
            "ASG(ro) {RULE(1, READ) {UAG(nobody)}}",
            false,
        )
        .expect("undefined UAG must not fail the load");
        assert!(base.asgs[base.find_asg("ro").unwrap()].rules[0].ignore);
    }

    #[test]
    fn test_malformed_rejected() {
        let rejected = [
            // missing commas in an arg list
            "GENERIC(not well-formed arg list)\nASG(ro) {RULE(0, READ)}",
            // invalid string list body
            "GENERIC(WELL, FORMED) {\n\tNOT WELL-FORMED BODY\n}\nASG(ro) {RULE(0, READ)}",
            // keyword without an arg list
            "GENERIC {\n\tWELL, FORMED, LIST\n}\nASG(ro) {RULE(0, READ)}",
            // bad arg list in a recursive body
            "GENERIC(WELL, FORMED) {\n\tBODY(BAD ARG LIST)\n}\nASG(ro) {RULE(0, READ)}",
            // mixing list items with a nested declaration
            "GENERIC(WELL, FORMED) {\n\tLIST, BODY, MIXED, WITH,\n\tRECURSIVE_BODY(ARG, LIST)\n}\nASG(ro) {RULE(0, READ)}",
            // abuse of known elements
            "ASG(ro BAD ARG LIST) {RULE(0, NONE)}",
            "HAG(BAD ARG LIST) {localhost}\nASG(ro) {RULE(0, READ)}",
            "ASG(ro) {RULE(0 BAD ARG LIST)}",
            "ASG(ro, UNKNOWN_PERMISSION) {RULE(0, NONE)}",
            "ASG(ro) {RULE(0, NONE, UNKNOWN_FLAG)}",
            // recursive declarations inside list-only bodies
            "HAG(foo) {\n\tlocalhost,\n\tNETWORK(\"127.0.0.1\")\n}\nASG(ro) {RULE(0, READ)}",
            "UAG(foo) {\n\talice,\n\tGROUP(admin)\n}\nASG(ro) {RULE(0, READ)}",
        ];
        for config in rejected {
            let err = SecurityBase::from_raw(config, false)
                .err()
                .unwrap_or_else(|| panic!("'{}' should be rejected", config));
            assert_eq!(err.code(), 6, "'{}' should fail with badConfig", config);
        }
    }

    #[test]
    fn test_bad_calc_rejected() {
        let err = SecurityBase::from_raw(
            "ASG(ro) {INPA(temp) RULE(1, WRITE) {CALC(\"A := 1\")}}",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadCalc(_)), "got {:?}", err);

        let err = SecurityBase::from_raw(
            "ASG(ro) {INPA(temp) RULE(1, WRITE) {CALC(\"A +\")}}",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadCalc(_)), "got {:?}", err);
    }

    #[test]
    fn test_authority_chains() {
        let base = SecurityBase::from_raw(
            "\
AUTHORITY(ROOT, \"Org Root CA\") {
	AUTHORITY(\"Site Intermediate CA\") {
		AUTHORITY(CTRL, \"Site Control Systems CA\")
	}
}
ASG(ro) {RULE(0, READ)}
",
            false,
        )
        .expect("failed to parse authority tree");
        assert_eq!(base.authority_chain("ROOT"), Some("Org Root CA"));
        assert_eq!(
            base.authority_chain("Site Intermediate CA"),
            Some("Org Root CA\nSite Intermediate CA")
        );
        assert_eq!(
            base.authority_chain("CTRL"),
            Some("Org Root CA\nSite Intermediate CA\nSite Control Systems CA")
        );
        assert_eq!(base.authority_chain("nope"), None);
    }

    #[test]
    fn test_authority_chain_truncated() {
        use warden_api_types::MAX_AUTH_CHAIN;

        // 64 nested levels of 60 byte common names blow well past the cap
        let mut config = String::new();
        for i in 0..64 {
            config.push_str(&format!("AUTHORITY(CA{}, \"{:0>60}\") {{\n", i, i));
        }
        config.push_str(&"}\n".repeat(64));
        config.push_str("ASG(ro) {RULE(0, READ)}\n");

        let base = SecurityBase::from_raw(&config, false).expect("failed to parse");
        assert_eq!(base.authority_chain("CA0").unwrap().len(), 60);
        let deepest = base.authority_chain("CA63").unwrap();
        assert_eq!(deepest.len(), MAX_AUTH_CHAIN);
    }

    #[test]
    fn test_use_client_ip_resolution() {
        let base = SecurityBase::from_raw(
            "HAG(foo) {127.0.0.1, guaranteed.invalid.}\nASG(ro) {RULE(0, READ)}",
            true,
        )
        .expect("failed to parse");
        assert!(base.hag_member("foo", "127.0.0.1"));
        assert!(!base.hag_member("foo", "guaranteed.invalid."));
        let hag = &base.hags[0];
        assert!(hag
            .entries
            .contains(&"unresolved:guaranteed.invalid.".to_string()));
    }

    #[test]
    fn test_duplicate_entries_warn_only() {
        let base = SecurityBase::from_raw(
            "UAG(ops) {alice, alice}\nASG(ro) {RULE(0, READ)}",
            false,
        )
        .expect("duplicate users are not fatal");
        assert_eq!(base.uags[0].entries, vec!["alice".to_string()]);
    }
}
