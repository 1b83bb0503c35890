//! The decision engine: members, clients, rule evaluation and the policy
//! hot swap.
//!
//! One mutex guards the current snapshot, the member/client slabs and all
//! cached per client state; every registry operation takes it for its whole
//! duration. Change-of-access callbacks are invoked with the lock held and
//! must not call back into the engine. The `check_*` query helpers on
//! [`ClientHandle`] are deliberately lock free: they read only the client's
//! cached rights and the engine-active flag, both of which may lag one
//! policy swap by a moment.

use std::any::Any;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use warden_api_types::{AccessRights, ClientStatus, Error, Identity, DEFAULT_GROUP};
use warden_calc::MAX_ARGS;
use warden_config::{Asg, DumpStyle, SecurityBase};

use crate::slab::Slab;
use crate::trap_write::{TrapWriteMux, WriteToken};

pub type ClientCallback = Box<dyn Fn(ClientStatus, AccessRights) + Send + Sync>;
type UserData = Arc<dyn Any + Send + Sync>;

struct MemberRecord {
    /// The group name the resource asked for; kept verbatim so a reload can
    /// re-bind the member even if the group only exists in the new policy.
    group_name: String,
    asg: usize,
    clients: Vec<usize>,
    user_data: Option<UserData>,
}

struct ClientShared {
    access: AtomicU8,
    trap: AtomicBool,
}

struct ClientRecord {
    member: usize,
    level: i32,
    identity: Identity,
    shared: Arc<ClientShared>,
    callback: Option<ClientCallback>,
    user_data: Option<UserData>,
}

/// A resource attached to the engine.
#[derive(Clone, Debug)]
pub struct MemberHandle {
    id: usize,
}

/// An identity bound to a member, carrying the lock free access cache.
#[derive(Clone)]
pub struct ClientHandle {
    id: usize,
    shared: Arc<ClientShared>,
    active: Arc<AtomicBool>,
}

impl ClientHandle {
    /// The cached access rights from the last evaluation.
    pub fn access(&self) -> AccessRights {
        rights_from_raw(self.shared.access.load(Ordering::SeqCst))
    }

    /// Whether writes through this client are to be audited.
    pub fn trap_write(&self) -> bool {
        self.shared.trap.load(Ordering::SeqCst)
    }

    /// May this client read? Open when the engine is not active.
    pub fn check_get(&self) -> bool {
        !self.active.load(Ordering::SeqCst) || self.access() >= AccessRights::Read
    }

    /// May this client write? Open when the engine is not active.
    pub fn check_put(&self) -> bool {
        !self.active.load(Ordering::SeqCst) || self.access() >= AccessRights::Write
    }

    /// May this client issue remote procedure calls? Open when the engine is
    /// not active.
    pub fn check_rpc(&self) -> bool {
        !self.active.load(Ordering::SeqCst) || self.access() >= AccessRights::Rpc
    }
}

fn rights_from_raw(raw: u8) -> AccessRights {
    match raw {
        0 => AccessRights::None,
        1 => AccessRights::Read,
        2 => AccessRights::Write,
        _ => AccessRights::Rpc,
    }
}

#[derive(Default)]
struct EngineState {
    base: Option<SecurityBase>,
    members: Slab<MemberRecord>,
    clients: Slab<ClientRecord>,
}

impl EngineState {
    fn base(&self) -> Result<&SecurityBase, Error> {
        self.base.as_ref().ok_or(Error::NotActive)
    }

    fn base_mut(&mut self) -> Result<&mut SecurityBase, Error> {
        self.base.as_mut().ok_or(Error::NotActive)
    }
}

/// The access security engine. A process embeds one instance and consults
/// it on every read, write and RPC attempt.
#[derive(Default)]
pub struct SecurityEngine {
    state: Mutex<EngineState>,
    active: Arc<AtomicBool>,
    trap: TrapWriteMux,
}

impl SecurityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Load a policy, replacing the current one atomically.
    ///
    /// The new snapshot is built first; a parse failure leaves the engine
    /// exactly as it was, including its activity state. On success every
    /// existing member is re-bound by its recorded group name (falling back
    /// to `DEFAULT`), each surviving client is re-evaluated, and the engine
    /// becomes active. Re-entrant: may be called while active.
    pub fn init_from_str(&self, text: &str, use_client_ip: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let new_base = SecurityBase::from_raw(text, use_client_ip)?;
        let old_base = state.base.replace(new_base);
        if let Some(old_base) = old_base {
            for asg in &old_base.asgs {
                for &member in &asg.members {
                    if let Err(err) = bind_member(&mut state, member) {
                        log::error!("re-binding member after reload failed: {}", err);
                    }
                }
            }
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Attach a resource to the named group, falling back to `DEFAULT` when
    /// no such group exists in the current policy.
    pub fn add_member(&self, group_name: &str) -> Result<MemberHandle, Error> {
        self.check_active()?;
        let mut state = self.state.lock().unwrap();
        let id = state.members.insert(MemberRecord {
            group_name: group_name.to_string(),
            asg: 0,
            clients: Vec::new(),
            user_data: None,
        });
        bind_member(&mut state, id)?;
        Ok(MemberHandle { id })
    }

    /// Detach a resource. Fails with `ClientsExist` while clients are still
    /// attached.
    pub fn remove_member(&self, handle: MemberHandle) -> Result<(), Error> {
        self.check_active()?;
        let mut state = self.state.lock().unwrap();
        let record = state.members.get(handle.id).ok_or(Error::BadMember)?;
        if !record.clients.is_empty() {
            return Err(Error::ClientsExist);
        }
        let asg = record.asg;
        if let Some(asg) = state.base_mut()?.asgs.get_mut(asg) {
            asg.members.retain(|&id| id != handle.id);
        }
        state.members.remove(handle.id);
        Ok(())
    }

    /// Move a member to another group and re-evaluate its clients.
    pub fn change_group(&self, handle: &MemberHandle, group_name: &str) -> Result<(), Error> {
        self.check_active()?;
        let mut state = self.state.lock().unwrap();
        let record = state.members.get_mut(handle.id).ok_or(Error::BadMember)?;
        record.group_name = group_name.to_string();
        let asg = record.asg;
        if let Some(asg) = state.base_mut()?.asgs.get_mut(asg) {
            asg.members.retain(|&id| id != handle.id);
        }
        bind_member(&mut state, handle.id)
    }

    /// Bind an identity to a member. The host is lower-cased and an
    /// oversized authority chain truncated before the first evaluation.
    pub fn add_client(
        &self,
        member: &MemberHandle,
        level: i32,
        mut identity: Identity,
    ) -> Result<ClientHandle, Error> {
        self.check_active()?;
        identity.normalize();
        let mut state = self.state.lock().unwrap();
        state.members.get(member.id).ok_or(Error::BadMember)?;
        let shared = Arc::new(ClientShared {
            access: AtomicU8::new(AccessRights::None as u8),
            trap: AtomicBool::new(false),
        });
        let id = state.clients.insert(ClientRecord {
            member: member.id,
            level,
            identity,
            shared: shared.clone(),
            callback: None,
            user_data: None,
        });
        if let Some(record) = state.members.get_mut(member.id) {
            record.clients.push(id);
        }
        compute_client(&state, id)?;
        Ok(ClientHandle {
            id,
            shared,
            active: self.active.clone(),
        })
    }

    /// Replace a client's identity and level in place and re-evaluate.
    pub fn change_client(
        &self,
        handle: &ClientHandle,
        level: i32,
        mut identity: Identity,
    ) -> Result<(), Error> {
        self.check_active()?;
        identity.normalize();
        let mut state = self.state.lock().unwrap();
        let record = state.clients.get_mut(handle.id).ok_or(Error::BadClient)?;
        record.level = level;
        record.identity = identity;
        compute_client(&state, handle.id)
    }

    /// Unbind a client and release its slot.
    pub fn remove_client(&self, handle: ClientHandle) -> Result<(), Error> {
        self.check_active()?;
        let mut state = self.state.lock().unwrap();
        let record = state.clients.remove(handle.id).ok_or(Error::BadClient)?;
        if let Some(member) = state.members.get_mut(record.member) {
            member.clients.retain(|&id| id != handle.id);
        }
        Ok(())
    }

    /// Store a change-of-access callback. It is invoked once immediately so
    /// the caller observes the current state, then once per transition.
    /// Callbacks run with the engine lock held and must not re-enter the
    /// engine.
    pub fn register_callback(
        &self,
        handle: &ClientHandle,
        callback: impl Fn(ClientStatus, AccessRights) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        self.check_active()?;
        let mut state = self.state.lock().unwrap();
        let record = state.clients.get_mut(handle.id).ok_or(Error::BadClient)?;
        record.callback = Some(Box::new(callback));
        let access = rights_from_raw(record.shared.access.load(Ordering::SeqCst));
        (record.callback.as_ref().unwrap())(ClientStatus::ChangeOfAccess, access);
        Ok(())
    }

    /// Re-evaluate a single client.
    pub fn recompute_client(&self, handle: &ClientHandle) -> Result<(), Error> {
        self.check_active()?;
        let state = self.state.lock().unwrap();
        compute_client(&state, handle.id)
    }

    /// Re-evaluate the rule conditions of one group where inputs changed,
    /// then every client bound to it.
    pub fn recompute_group(&self, group_name: &str) -> Result<(), Error> {
        self.check_active()?;
        let mut state = self.state.lock().unwrap();
        let asg = state.base()?.find_asg(group_name).ok_or(Error::BadAsg)?;
        recompute_asg(&mut state, asg);
        Ok(())
    }

    /// Re-evaluate all groups and clients.
    pub fn recompute_all(&self) -> Result<(), Error> {
        self.check_active()?;
        let mut state = self.state.lock().unwrap();
        for asg in 0..state.base()?.asgs.len() {
            recompute_asg(&mut state, asg);
        }
        Ok(())
    }

    /// Feed a live input value into a group: `Some(value)` updates it,
    /// `None` marks it bad. Marks the input changed; call
    /// [`recompute_group`](Self::recompute_group) to apply.
    pub fn set_input(&self, group_name: &str, index: usize, value: Option<f64>) -> Result<(), Error> {
        self.check_active()?;
        if index >= MAX_ARGS {
            return Err(Error::BadCalc(format!("input index {} out of range", index)));
        }
        let mut state = self.state.lock().unwrap();
        let asg = state.base()?.find_asg(group_name).ok_or(Error::BadAsg)?;
        let asg = &mut state.base_mut()?.asgs[asg];
        let bit = 1u32 << index;
        match value {
            Some(value) => {
                asg.values[index] = value;
                asg.inp_bad &= !bit;
            }
            None => asg.inp_bad |= bit,
        }
        asg.inp_changed |= bit;
        Ok(())
    }

    pub fn set_member_user_data(&self, handle: &MemberHandle, data: UserData) {
        if !self.is_active() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.members.get_mut(handle.id) {
            record.user_data = Some(data);
        }
    }

    pub fn member_user_data(&self, handle: &MemberHandle) -> Option<UserData> {
        if !self.is_active() {
            return None;
        }
        let state = self.state.lock().unwrap();
        state.members.get(handle.id)?.user_data.clone()
    }

    pub fn set_client_user_data(&self, handle: &ClientHandle, data: UserData) {
        if !self.is_active() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.clients.get_mut(handle.id) {
            record.user_data = Some(data);
        }
    }

    pub fn client_user_data(&self, handle: &ClientHandle) -> Option<UserData> {
        if !self.is_active() {
            return None;
        }
        let state = self.state.lock().unwrap();
        state.clients.get(handle.id)?.user_data.clone()
    }

    /// The write audit multiplexer, for listener registration.
    pub fn trap_writes(&self) -> &TrapWriteMux {
        &self.trap
    }

    /// Pre-write audit hook. Returns a token iff the engine is active, the
    /// client's current rule carries `TRAPWRITE`, and at least one listener
    /// is registered; pass it to [`write_notify_after`](Self::write_notify_after)
    /// once the write completed.
    pub fn write_notify_before(
        &self,
        client: &ClientHandle,
        target: &str,
        type_code: i32,
        count: usize,
        data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Option<WriteToken> {
        if !self.is_active() || !client.trap_write() {
            return None;
        }
        let identity = {
            let state = self.state.lock().unwrap();
            state.clients.get(client.id)?.identity.clone()
        };
        self.trap
            .before(identity, target.to_string(), type_code, count, data)
    }

    /// Post-write audit hook, the counterpart of
    /// [`write_notify_before`](Self::write_notify_before).
    pub fn write_notify_after(&self, token: Option<WriteToken>) {
        if let Some(token) = token {
            self.trap.after(token);
        }
    }

    /// Pretty-print the current policy; with `verbose` the live input
    /// state, calc results and per group member/client lists are included.
    pub fn dump(&self, w: &mut dyn Write, verbose: bool) -> Result<(), anyhow::Error> {
        if !self.is_active() {
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        let base = match state.base.as_ref() {
            Some(base) => base,
            None => return Ok(()),
        };
        let style = if verbose {
            DumpStyle::Verbose
        } else {
            DumpStyle::Plain
        };
        base.write_uags(w, None)?;
        base.write_hags(w, None)?;
        base.write_authorities(w)?;
        for asg in &base.asgs {
            let brace = base.write_asg_open(w, asg, style)?;
            if verbose && !asg.members.is_empty() {
                writeln!(w, "\tMEMBERLIST")?;
                for &member in &asg.members {
                    let record = match state.members.get(member) {
                        Some(record) => record,
                        None => continue,
                    };
                    if record.group_name.is_empty() {
                        writeln!(w, "\t\t<null>")?;
                    } else {
                        writeln!(w, "\t\t{}", record.group_name)?;
                    }
                    for &client in &record.clients {
                        let client = match state.clients.get(client) {
                            Some(client) => client,
                            None => continue,
                        };
                        write!(
                            w,
                            "\t\t\t {} {}",
                            client.identity.user, client.identity.host
                        )?;
                        if (0..=1).contains(&client.level) {
                            write!(w, " ASL{}", client.level)?;
                        } else {
                            write!(w, " Illegal Level {}", client.level)?;
                        }
                        let access = rights_from_raw(client.shared.access.load(Ordering::SeqCst));
                        writeln!(
                            w,
                            " {} {}",
                            access,
                            if client.shared.trap.load(Ordering::SeqCst) {
                                "TRAPWRITE"
                            } else {
                                "NOTRAPWRITE"
                            }
                        )?;
                    }
                }
            }
            if brace {
                writeln!(w, "}}")?;
            }
        }
        Ok(())
    }

    /// Rules listing, optionally restricted to one group.
    pub fn dump_rules(&self, w: &mut dyn Write, group: Option<&str>) -> Result<(), anyhow::Error> {
        if !self.is_active() {
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        if let Some(base) = state.base.as_ref() {
            base.write_rules(w, group)?;
        }
        Ok(())
    }

    /// User access group listing, optionally restricted to one group.
    pub fn dump_uags(&self, w: &mut dyn Write, group: Option<&str>) -> Result<(), anyhow::Error> {
        if !self.is_active() {
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        if let Some(base) = state.base.as_ref() {
            base.write_uags(w, group)?;
        }
        Ok(())
    }

    /// Host access group listing, optionally restricted to one group.
    pub fn dump_hags(&self, w: &mut dyn Write, group: Option<&str>) -> Result<(), anyhow::Error> {
        if !self.is_active() {
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        if let Some(base) = state.base.as_ref() {
            base.write_hags(w, group)?;
        }
        Ok(())
    }

    fn check_active(&self) -> Result<(), Error> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::NotActive)
        }
    }
}

/// Bind a member to the group it asked for, or to `DEFAULT`, and
/// re-evaluate its clients.
fn bind_member(state: &mut EngineState, id: usize) -> Result<(), Error> {
    let group_name = state
        .members
        .get(id)
        .ok_or(Error::BadMember)?
        .group_name
        .clone();
    let base = state.base_mut()?;
    let asg = match base.find_asg(&group_name) {
        Some(asg) => asg,
        None => base.find_asg(DEFAULT_GROUP).ok_or(Error::BadAsg)?,
    };
    base.asgs[asg].members.push(id);
    let clients = {
        let record = state.members.get_mut(id).ok_or(Error::BadMember)?;
        record.asg = asg;
        record.clients.clone()
    };
    for client in clients {
        compute_client(state, client)?;
    }
    Ok(())
}

/// Evaluate one client against its group and update the cached access.
/// Fires the change callback iff the access actually changed.
fn compute_client(state: &EngineState, id: usize) -> Result<(), Error> {
    let client = state.clients.get(id).ok_or(Error::BadClient)?;
    let member = state.members.get(client.member).ok_or(Error::BadMember)?;
    let base = state.base()?;
    let asg = base.asgs.get(member.asg).ok_or(Error::BadAsg)?;

    let (access, trap) = evaluate(base, asg, &client.identity, client.level);

    let old = client.shared.access.swap(access as u8, Ordering::SeqCst);
    client.shared.trap.store(trap, Ordering::SeqCst);
    if old != access as u8 {
        if let Some(callback) = &client.callback {
            callback(ClientStatus::ChangeOfAccess, access);
        }
    }
    Ok(())
}

/// The rule scan. Rules apply in declaration order and a later rule may
/// upgrade the running result; the scan stops early once write access is
/// granted (historically `write`, not the maximum, so a trailing RPC rule
/// is still reachable while only read is held).
fn evaluate(base: &SecurityBase, asg: &Asg, identity: &Identity, level: i32) -> (AccessRights, bool) {
    let mut access = AccessRights::None;
    let mut trap = false;

    for rule in &asg.rules {
        if rule.ignore {
            continue;
        }
        if access >= AccessRights::Write {
            break;
        }
        if access >= rule.access {
            continue;
        }
        if level > rule.level {
            continue;
        }
        if let Some(required) = rule.protocol {
            if identity.protocol != Some(required) {
                continue;
            }
        }
        if !rule.uags.is_empty()
            && !rule
                .uags
                .iter()
                .any(|name| base.uag_member(name, &identity.user))
        {
            continue;
        }
        if !rule.hags.is_empty()
            && !rule
                .hags
                .iter()
                .any(|name| base.hag_member(name, &identity.host))
        {
            continue;
        }
        if !rule.methods.is_empty() && !rule.methods.iter().any(|m| *m == identity.method) {
            continue;
        }
        if !rule.authorities.is_empty() {
            // prefix match over the stored chain: an exact match or a client
            // chain extending past the trusted prefix both pass ("trust by
            // ancestor"); unknown authority names never match
            let matched = rule.authorities.iter().any(|name| {
                base.authority_chain(name)
                    .map(|chain| identity.authority.starts_with(chain))
                    .unwrap_or(false)
            });
            if !matched {
                continue;
            }
        }
        if let Some(calc) = &rule.calc {
            if (asg.inp_bad & calc.inp_used) != 0 || !rule.result {
                continue;
            }
        }
        access = rule.access;
        trap = rule.trap;
    }

    (access, trap)
}

/// Re-evaluate calc results for rules whose inputs changed, clear the
/// changed bitmap, then re-evaluate every client bound to the group.
fn recompute_asg(state: &mut EngineState, asg_idx: usize) {
    let base = match state.base.as_mut() {
        Some(base) => base,
        None => return,
    };
    let asg = &mut base.asgs[asg_idx];
    let inp_changed = asg.inp_changed;
    let values = asg.values;
    for rule in &mut asg.rules {
        if rule.ignore {
            continue;
        }
        if let Some(calc) = &rule.calc {
            if (inp_changed & calc.inp_used) == 0 {
                continue;
            }
            match calc.program.eval(&values) {
                Ok(result) => rule.result = result > 0.99 && result < 1.01,
                Err(err) => {
                    rule.result = false;
                    if !rule.warned {
                        log::warn!("rule condition '{}' failed: {}", calc.source, err);
                        rule.warned = true;
                    }
                }
            }
        }
    }
    asg.inp_changed = 0;

    let members = asg.members.clone();
    for member in members {
        let clients = state
            .members
            .get(member)
            .map(|record| record.clients.clone())
            .unwrap_or_default();
        for client in clients {
            if let Err(err) = compute_client(state, client) {
                log::error!("client re-evaluation failed: {}", err);
            }
        }
    }
}
