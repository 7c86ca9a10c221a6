//! Stub peers, tables and routes for driving the core deterministically.

#![allow(dead_code)]

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ribflow_bgp::attr::{AsNumber, AsPath, Attr};
use ribflow_bgp::config::CoreConfig;
use ribflow_bgp::iface::{
    DoneWalkFn, EntryWalkFn, PathFlags, PathSource, Peer, PeerRef, RouteEntry, RoutePath,
    RouteRef, Table, TableRef, UpdateMessage, WalkRef,
};
use ribflow_bgp::membership::MembershipManager;
use ribflow_bgp::policy::{Encoding, PeerType, RibExportPolicy};
use ribflow_bgp::ribout::{RibOut, RibOutMap};
use ribflow_bgp::sender::UpdateSender;
use ribflow_bgp::tasks;
use ribflow_core::task::TaskScope;

pub struct StubPeer {
    name: String,
    xmpp: bool,
    ready: AtomicBool,
    send_ready: AtomicBool,
    /// When false, `send_update` reports blocked even though the socket
    /// claims to be writable.
    accepting: AtomicBool,
    gr_wait: AtomicBool,
    path_notify: AtomicBool,
    sent: Mutex<Vec<UpdateMessage>>,
    request_callbacks: Mutex<Vec<String>>,
    path_callbacks: AtomicUsize,
}

impl StubPeer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            xmpp: false,
            ready: AtomicBool::new(true),
            send_ready: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            gr_wait: AtomicBool::new(false),
            path_notify: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            request_callbacks: Mutex::new(Vec::new()),
            path_callbacks: AtomicUsize::new(0),
        })
    }

    pub fn xmpp(name: &str) -> Arc<Self> {
        let peer = Self::new(name);
        // Arc::get_mut is fine here, nothing has cloned it yet.
        let mut peer = peer;
        Arc::get_mut(&mut peer).unwrap().xmpp = true;
        peer
    }

    pub fn set_send_ready(&self, ready: bool) {
        self.send_ready.store(ready, Ordering::Relaxed);
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    pub fn set_gr_wait(&self, waiting: bool) {
        self.gr_wait.store(waiting, Ordering::Relaxed);
    }

    pub fn set_path_notify(&self, notify: bool) {
        self.path_notify.store(notify, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<UpdateMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn request_callbacks(&self) -> Vec<String> {
        self.request_callbacks.lock().clone()
    }

    pub fn path_callback_count(&self) -> usize {
        self.path_callbacks.load(Ordering::Relaxed)
    }
}

impl Peer for StubPeer {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn send_ready(&self) -> bool {
        self.send_ready.load(Ordering::Relaxed)
    }

    fn send_update(&self, update: &UpdateMessage) -> bool {
        if !self.send_ready() || !self.accepting.load(Ordering::Relaxed) {
            return false;
        }
        self.sent.lock().push(update.clone());
        true
    }

    fn is_xmpp(&self) -> bool {
        self.xmpp
    }

    fn membership_request_callback(&self, table: &TableRef) {
        self.request_callbacks.lock().push(table.name().to_string());
    }

    fn membership_path_callback(
        &self,
        _partition: usize,
        _route: &RouteRef,
        _path: &RoutePath,
    ) -> bool {
        self.path_callbacks.fetch_add(1, Ordering::Relaxed);
        self.path_notify.load(Ordering::Relaxed)
    }

    fn in_gr_timer_wait(&self) -> bool {
        self.gr_wait.load(Ordering::Relaxed)
    }
}

pub fn peer_ref(peer: &Arc<StubPeer>) -> PeerRef {
    PeerRef::new(peer.clone())
}

pub struct StubRoute {
    key: Bytes,
    paths: Mutex<Vec<RoutePath>>,
}

impl StubRoute {
    pub fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            key: Bytes::from(key.to_string()),
            paths: Mutex::new(Vec::new()),
        })
    }

    pub fn add_path(&self, path: RoutePath) {
        self.paths.lock().push(path);
    }
}

impl RouteEntry for StubRoute {
    fn key(&self) -> Bytes {
        self.key.clone()
    }

    fn best_path(&self) -> Option<RoutePath> {
        self.paths.lock().first().cloned()
    }

    fn paths(&self) -> Vec<RoutePath> {
        self.paths.lock().clone()
    }
}

pub fn route_ref(route: &Arc<StubRoute>) -> RouteRef {
    RouteRef::new(route.clone())
}

/// Builder for one route path.
pub struct PathBuilder {
    peer: Option<PeerRef>,
    source: PathSource,
    flags: PathFlags,
    secondary: bool,
    attr: Attr,
}

impl PathBuilder {
    pub fn new(source: PathSource) -> Self {
        Self {
            peer: None,
            source,
            flags: PathFlags::default(),
            secondary: false,
            attr: Attr::default(),
        }
    }

    pub fn peer(mut self, peer: &PeerRef) -> Self {
        self.peer = Some(peer.clone());
        self
    }

    pub fn infeasible(mut self) -> Self {
        self.flags.infeasible = true;
        self
    }

    pub fn llgr_stale(mut self) -> Self {
        self.flags.llgr_stale = true;
        self
    }

    pub fn resolved(mut self) -> Self {
        self.flags.resolved = true;
        self
    }

    pub fn secondary(mut self) -> Self {
        self.secondary = true;
        self
    }

    pub fn local_pref(mut self, value: u32) -> Self {
        self.attr.local_pref = value;
        self
    }

    pub fn med(mut self, value: u32) -> Self {
        self.attr.med = value;
        self
    }

    pub fn as_path(mut self, hops: &[AsNumber]) -> Self {
        self.attr.as_path = Some(AsPath::from_sequence(hops.iter().copied()));
        self
    }

    pub fn empty_as_path(mut self) -> Self {
        self.attr.as_path = Some(AsPath::new());
        self
    }

    pub fn community(mut self, value: u32) -> Self {
        self.attr.add_community(value);
        self
    }

    pub fn ext_community(mut self, value: u64) -> Self {
        self.attr.ext_communities.push(value);
        self
    }

    pub fn originator_id(mut self, id: Ipv4Addr) -> Self {
        self.attr.originator_id = Some(id);
        self
    }

    pub fn cluster_list(mut self, ids: &[u32]) -> Self {
        self.attr.cluster_list = ids.to_vec();
        self
    }

    pub fn build(self) -> RoutePath {
        RoutePath {
            peer: self.peer,
            source: self.source,
            flags: self.flags,
            secondary: self.secondary,
            attr: Arc::new(self.attr),
        }
    }
}

/// Route with one path, ready to export.
pub fn single_path_route(key: &str, path: RoutePath) -> RouteRef {
    let route = StubRoute::new(key);
    route.add_path(path);
    route_ref(&route)
}

pub struct StubTable {
    name: String,
    partition_count: usize,
    deleted: AtomicBool,
    vpn: bool,
    defer_walks: AtomicBool,
    pub ribouts: RibOutMap,
    routes: Mutex<Vec<(usize, RouteRef)>>,
    walkers: Mutex<HashMap<u64, (EntryWalkFn, DoneWalkFn)>>,
    deferred: Mutex<Vec<WalkRef>>,
    next_walk: AtomicU64,
    walk_calls: AtomicUsize,
    post_calls: Mutex<Vec<(Bytes, bool)>>,
    self_ref: Mutex<Weak<StubTable>>,
}

impl StubTable {
    pub fn new(name: &str, partition_count: usize) -> Arc<Self> {
        Self::build(name, partition_count, false, false)
    }

    pub fn vpn(name: &str, partition_count: usize) -> Arc<Self> {
        Self::build(name, partition_count, true, false)
    }

    pub fn deleted(name: &str, partition_count: usize) -> Arc<Self> {
        Self::build(name, partition_count, false, true)
    }

    fn build(name: &str, partition_count: usize, vpn: bool, deleted: bool) -> Arc<Self> {
        let table = Arc::new(Self {
            name: name.to_string(),
            partition_count,
            deleted: AtomicBool::new(deleted),
            vpn,
            defer_walks: AtomicBool::new(false),
            ribouts: RibOutMap::new(),
            routes: Mutex::new(Vec::new()),
            walkers: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            next_walk: AtomicU64::new(1),
            walk_calls: AtomicUsize::new(0),
            post_calls: Mutex::new(Vec::new()),
            self_ref: Mutex::new(Weak::new()),
        });
        *table.self_ref.lock() = Arc::downgrade(&table);
        table
    }

    pub fn handle(&self) -> TableRef {
        TableRef::new(self.self_ref.lock().upgrade().expect("table alive"))
    }

    pub fn add_route(&self, partition: usize, route: RouteRef) {
        assert!(partition < self.partition_count);
        self.routes.lock().push((partition, route));
    }

    pub fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::Relaxed);
    }

    pub fn set_defer_walks(&self, defer: bool) {
        self.defer_walks.store(defer, Ordering::Relaxed);
    }

    /// Execute walks postponed by `set_defer_walks`.
    pub fn run_deferred_walks(&self) {
        let pending: Vec<WalkRef> = self.deferred.lock().drain(..).collect();
        for walk in pending {
            self.run_walk(&walk);
        }
    }

    pub fn walk_calls(&self) -> usize {
        self.walk_calls.load(Ordering::Relaxed)
    }

    pub fn post_process_calls(&self) -> Vec<(Bytes, bool)> {
        self.post_calls.lock().clone()
    }

    fn run_walk(&self, walk: &WalkRef) {
        let callbacks = self.walkers.lock().get(&walk.token()).cloned();
        let Some((entry_cb, done_cb)) = callbacks else {
            return;
        };
        let routes: Vec<(usize, RouteRef)> = self.routes.lock().clone();
        for (partition, route) in &routes {
            entry_cb(*partition, route);
        }
        done_cb();
    }
}

impl Table for StubTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn partition_count(&self) -> usize {
        self.partition_count
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    fn is_vpn(&self) -> bool {
        self.vpn
    }

    fn alloc_walker(&self, entry_cb: EntryWalkFn, done_cb: DoneWalkFn) -> WalkRef {
        let token = self.next_walk.fetch_add(1, Ordering::Relaxed);
        self.walkers.lock().insert(token, (entry_cb, done_cb));
        WalkRef::new(token)
    }

    fn walk_table(&self, walk: &WalkRef) {
        self.walk_calls.fetch_add(1, Ordering::Relaxed);
        if self.defer_walks.load(Ordering::Relaxed) {
            self.deferred.lock().push(*walk);
        } else {
            self.run_walk(walk);
        }
    }

    fn release_walker(&self, walk: WalkRef) {
        self.walkers.lock().remove(&walk.token());
    }

    fn ribout_locate(&self, sender: &Arc<UpdateSender>, policy: &RibExportPolicy) -> Arc<RibOut> {
        self.ribouts.locate(&self.handle(), sender, policy)
    }

    fn input_common_post_process(&self, _partition: usize, route: &RouteRef, notify: bool) {
        self.post_calls.lock().push((route.key(), notify));
    }
}

/// Sender + membership manager over the default test config (AS 200).
pub fn setup(partitions: usize) -> (Arc<UpdateSender>, Arc<MembershipManager>) {
    let config = CoreConfig::default()
        .with_autonomous_system(200)
        .with_partition_count(partitions);
    let sender = UpdateSender::new(config).unwrap();
    let membership = MembershipManager::new(sender.clone());
    (sender, membership)
}

pub fn ebgp_policy(as_number: AsNumber) -> RibExportPolicy {
    RibExportPolicy::new(PeerType::Ebgp, Encoding::Bgp, as_number)
}

pub fn ibgp_policy() -> RibExportPolicy {
    RibExportPolicy::new(PeerType::Ibgp, Encoding::Bgp, 200)
}

pub fn xmpp_policy() -> RibExportPolicy {
    RibExportPolicy::xmpp()
}

/// Run the route-change export path for one route, as the table
/// partition task would.
pub fn export_route(ribout: &Arc<RibOut>, partition: usize, route: &RouteRef) -> bool {
    let _scope = TaskScope::enter(tasks::TABLE_PARTITION);
    ribout.bgp_export().export(partition, route)
}

/// Register a peer directly with a ribout, as the membership task would.
pub fn ribout_register(ribout: &Arc<RibOut>, peer: &PeerRef) {
    let _scope = TaskScope::enter(tasks::MEMBERSHIP);
    ribout.register(peer);
}

/// Run the route-refresh path for one route and peer set.
pub fn refresh_route(
    ribout: &Arc<RibOut>,
    partition: usize,
    set: &ribflow_core::bitset::BitSet,
    route: &RouteRef,
) -> bool {
    let _scope = TaskScope::enter(tasks::TABLE_PARTITION);
    ribout.bgp_export().refresh(partition, set, route)
}
