//! Export filter behavior, observed end to end: route change -> ribout
//! queue -> partition worker -> peer.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use common::*;
use ribflow_bgp::attr::{community, Attr};
use ribflow_bgp::config::CoreConfig;
use ribflow_bgp::iface::{PathSource, PeerRef, RouteRef};
use ribflow_bgp::policy::RibExportPolicy;
use ribflow_bgp::ribout::RibOut;
use ribflow_bgp::sender::UpdateSender;

struct ExportFixture {
    sender: Arc<UpdateSender>,
    ribout: Arc<RibOut>,
}

impl ExportFixture {
    fn new(policy: RibExportPolicy) -> Self {
        Self::with_config(policy, CoreConfig::default().with_autonomous_system(200), false)
    }

    fn vpn(policy: RibExportPolicy) -> Self {
        Self::with_config(policy, CoreConfig::default().with_autonomous_system(200), true)
    }

    fn with_config(policy: RibExportPolicy, config: CoreConfig, vpn: bool) -> Self {
        let config = config.with_partition_count(1);
        let sender = UpdateSender::new(config).unwrap();
        let table = if vpn {
            StubTable::vpn("bgp.l3vpn.0", 1)
        } else {
            StubTable::new("inet.0", 1)
        };
        let ribout = table.ribouts.locate(&table.handle(), &sender, &policy);
        Self { sender, ribout }
    }

    fn register(&self, peer: &Arc<StubPeer>) -> PeerRef {
        let peer = peer_ref(peer);
        ribout_register(&self.ribout, &peer);
        peer
    }

    /// Export one route and drain the partition.
    fn run(&self, route: &RouteRef) {
        export_route(&self.ribout, 0, route);
        self.sender.process_partition(0);
    }

    fn assert_rejected(&self, route: &RouteRef) {
        assert!(!export_route(&self.ribout, 0, route));
        assert_eq!(self.ribout.queue_depth(), 0);
    }
}

fn received_attr(peer: &Arc<StubPeer>) -> Arc<Attr> {
    let sent = peer.sent();
    assert_eq!(sent.len(), 1, "expected exactly one update");
    sent[0].attr.clone()
}

#[test]
fn ebgp_export_rewrites_attributes_from_internal_source() {
    let fixture = ExportFixture::new(ebgp_policy(300));
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.1.1.0/24",
        PathBuilder::new(PathSource::Ibgp)
            .local_pref(100)
            .med(100)
            .empty_as_path()
            .originator_id(Ipv4Addr::new(192, 0, 2, 1))
            .cluster_list(&[7])
            .build(),
    );
    fixture.run(&route);

    let attr = received_attr(&target);
    assert_eq!(attr.local_pref, 0);
    assert_eq!(attr.med, 100);
    assert_eq!(attr.as_path.as_ref().unwrap().as_slice(), &[200]);
    assert!(attr.originator_id.is_none());
    assert!(attr.cluster_list.is_empty());
}

#[test]
fn ebgp_clears_med_when_as_path_is_non_empty() {
    let fixture = ExportFixture::new(ebgp_policy(300));
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.1.2.0/24",
        PathBuilder::new(PathSource::Ebgp)
            .med(100)
            .as_path(&[100])
            .build(),
    );
    fixture.run(&route);

    let attr = received_attr(&target);
    assert_eq!(attr.med, 0);
    assert_eq!(attr.as_path.as_ref().unwrap().as_slice(), &[200, 100]);
}

#[test]
fn as_override_substitutes_peer_as_and_splits_horizon() {
    let fixture = ExportFixture::new(ebgp_policy(100).with_as_override());
    let source = StubPeer::new("source");
    let target = StubPeer::new("target");
    let source_ref = fixture.register(&source);
    fixture.register(&target);

    let route = single_path_route(
        "10.2.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .peer(&source_ref)
            .as_path(&[100, 400])
            .build(),
    );
    fixture.run(&route);

    // The source peer never sees its own route back.
    assert_eq!(source.sent_count(), 0);
    let attr = received_attr(&target);
    assert_eq!(attr.as_path.as_ref().unwrap().as_slice(), &[200, 200, 400]);
}

#[test]
fn as_path_loop_rejects_without_override() {
    let fixture = ExportFixture::new(ebgp_policy(300));
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.3.0.0/16",
        PathBuilder::new(PathSource::Ebgp).as_path(&[300, 400]).build(),
    );
    fixture.assert_rejected(&route);
}

#[test]
fn no_advertise_rejects_bgp_but_not_xmpp() {
    for policy in [ebgp_policy(300), ibgp_policy()] {
        let fixture = ExportFixture::new(policy);
        let target = StubPeer::new("target");
        fixture.register(&target);
        let route = single_path_route(
            "10.4.0.0/16",
            PathBuilder::new(PathSource::Ebgp)
                .as_path(&[100])
                .community(community::NO_ADVERTISE)
                .build(),
        );
        fixture.assert_rejected(&route);
    }

    let fixture = ExportFixture::new(xmpp_policy());
    let agent = StubPeer::xmpp("agent");
    fixture.register(&agent);
    let route = single_path_route(
        "10.4.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[100])
            .community(community::NO_ADVERTISE)
            .build(),
    );
    fixture.run(&route);
    assert_eq!(agent.sent_count(), 1);
}

#[test]
fn no_export_rejects_ebgp_only() {
    let fixture = ExportFixture::new(ebgp_policy(300));
    let target = StubPeer::new("target");
    fixture.register(&target);
    let rejected = single_path_route(
        "10.5.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[100])
            .community(community::NO_EXPORT)
            .build(),
    );
    fixture.assert_rejected(&rejected);

    let fixture = ExportFixture::new(ibgp_policy());
    let target = StubPeer::new("target");
    fixture.register(&target);
    let accepted = single_path_route(
        "10.5.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[100])
            .community(community::NO_EXPORT)
            .build(),
    );
    fixture.run(&accepted);
    assert_eq!(target.sent_count(), 1);
}

#[test]
fn ibgp_split_horizon_rejects_internal_source() {
    let fixture = ExportFixture::new(ibgp_policy());
    let target = StubPeer::new("target");
    fixture.register(&target);
    let route = single_path_route(
        "10.6.0.0/16",
        PathBuilder::new(PathSource::Ibgp).local_pref(50).build(),
    );
    fixture.assert_rejected(&route);
}

#[test]
fn ibgp_sets_default_local_pref_without_prepending() {
    let fixture = ExportFixture::new(ibgp_policy());
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.7.0.0/16",
        PathBuilder::new(PathSource::Ebgp).med(70).as_path(&[100]).build(),
    );
    fixture.run(&route);

    let attr = received_attr(&target);
    assert_eq!(attr.local_pref, 100);
    assert_eq!(attr.med, 70);
    assert_eq!(attr.as_path.as_ref().unwrap().as_slice(), &[100]);
}

#[test]
fn ibgp_keeps_existing_local_pref() {
    let fixture = ExportFixture::new(ibgp_policy());
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.8.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .local_pref(300)
            .as_path(&[100])
            .build(),
    );
    fixture.run(&route);
    assert_eq!(received_attr(&target).local_pref, 300);
}

#[test]
fn extended_communities_are_stripped_except_for_vpn_families() {
    let route = || {
        single_path_route(
            "10.9.0.0/16",
            PathBuilder::new(PathSource::Ebgp)
                .as_path(&[100])
                .ext_community(0x0002_fde8_0000_0001)
                .build(),
        )
    };

    let fixture = ExportFixture::new(ebgp_policy(300));
    let target = StubPeer::new("target");
    fixture.register(&target);
    fixture.run(&route());
    assert!(received_attr(&target).ext_communities.is_empty());

    let fixture = ExportFixture::vpn(ebgp_policy(300));
    let target = StubPeer::new("target");
    fixture.register(&target);
    fixture.run(&route());
    assert_eq!(
        received_attr(&target).ext_communities,
        vec![0x0002_fde8_0000_0001]
    );
}

#[test]
fn nexthop_rewrite_applies_on_export() {
    let rewrite = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));
    let fixture = ExportFixture::new(ebgp_policy(300).with_nexthop(rewrite));
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.10.0.0/16",
        PathBuilder::new(PathSource::Ebgp).as_path(&[100]).build(),
    );
    fixture.run(&route);
    assert_eq!(received_attr(&target).next_hop, rewrite);
}

#[test]
fn remove_private_replace_substitutes_mixed_path() {
    let fixture =
        ExportFixture::new(ebgp_policy(300).with_remove_private(true, true, true));
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.11.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[64514, 64515, 64516, 600, 64512, 64513, 500, 65535])
            .build(),
    );
    fixture.run(&route);

    // Local AS is prepended first; leading privates then take the nearest
    // preceding public (the freshly prepended 200), the rest take the
    // nearest public to their left.
    assert_eq!(
        received_attr(&target).as_path.as_ref().unwrap().as_slice(),
        &[200, 200, 200, 200, 600, 600, 600, 500, 500]
    );
}

#[test]
fn remove_private_without_replace_deletes() {
    let fixture =
        ExportFixture::new(ebgp_policy(300).with_remove_private(true, false, true));
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.12.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[64512, 65535, 100])
            .build(),
    );
    fixture.run(&route);
    assert_eq!(
        received_attr(&target).as_path.as_ref().unwrap().as_slice(),
        &[200, 100]
    );
}

#[test]
fn llgr_stale_paths_carry_stale_community_for_capable_peers() {
    let fixture = ExportFixture::new(ebgp_policy(300).with_llgr());
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.13.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[100])
            .llgr_stale()
            .build(),
    );
    fixture.run(&route);

    let attr = received_attr(&target);
    assert!(attr.has_community(community::LLGR_STALE));
    assert!(!attr.has_community(community::NO_EXPORT));
}

#[test]
fn llgr_stale_paths_are_fenced_for_incapable_peers() {
    let fixture = ExportFixture::new(ibgp_policy());
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.14.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[100])
            .llgr_stale()
            .build(),
    );
    fixture.run(&route);

    let attr = received_attr(&target);
    assert!(attr.has_community(community::NO_EXPORT));
    assert_eq!(attr.local_pref, 0);
}

#[test]
fn xmpp_ribouts_pass_attributes_through_unchanged() {
    let fixture = ExportFixture::new(xmpp_policy());
    let agent = StubPeer::xmpp("agent");
    fixture.register(&agent);

    let path = PathBuilder::new(PathSource::Ebgp)
        .local_pref(77)
        .med(88)
        .as_path(&[100, 64512])
        .community(community::NO_EXPORT)
        .ext_community(42)
        .originator_id(Ipv4Addr::new(192, 0, 2, 9))
        .build();
    let input_attr = path.attr.clone();
    let route = single_path_route("10.15.0.0/16", path);
    fixture.run(&route);

    assert_eq!(received_attr(&agent), input_attr);
}

#[test]
fn routes_without_usable_best_path_are_rejected() {
    let fixture = ExportFixture::new(ebgp_policy(300));
    let target = StubPeer::new("target");
    fixture.register(&target);

    let empty = route_ref(&StubRoute::new("10.16.0.0/16"));
    fixture.assert_rejected(&empty);

    let infeasible = single_path_route(
        "10.16.1.0/24",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[100])
            .infeasible()
            .build(),
    );
    fixture.assert_rejected(&infeasible);

    let secondary = single_path_route(
        "10.16.2.0/24",
        PathBuilder::new(PathSource::Ebgp)
            .as_path(&[100])
            .secondary()
            .build(),
    );
    fixture.assert_rejected(&secondary);
}

#[test]
fn configured_local_as_wins_over_system_as() {
    let config = CoreConfig::default()
        .with_autonomous_system(200)
        .with_local_autonomous_system(201);
    let fixture = ExportFixture::with_config(ebgp_policy(300), config, false);
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.17.0.0/16",
        PathBuilder::new(PathSource::Ebgp).as_path(&[100]).build(),
    );
    fixture.run(&route);
    assert_eq!(
        received_attr(&target).as_path.as_ref().unwrap().as_slice(),
        &[201, 100]
    );
}

#[test]
fn refresh_readvertises_to_the_requested_peers_only() {
    let fixture = ExportFixture::new(ebgp_policy(300));
    let p1 = StubPeer::new("p1");
    let p2 = StubPeer::new("p2");
    let h1 = fixture.register(&p1);
    fixture.register(&p2);

    let route = single_path_route(
        "10.19.0.0/16",
        PathBuilder::new(PathSource::Ebgp).as_path(&[100]).build(),
    );
    fixture.run(&route);
    assert_eq!(p1.sent_count(), 1);
    assert_eq!(p2.sent_count(), 1);

    // Refresh only p1.
    let index = fixture.ribout.peer_index(&h1).unwrap();
    let set = ribflow_core::bitset::BitSet::from_bits([index]);
    assert!(refresh_route(&fixture.ribout, 0, &set, &route));
    fixture.sender.process_partition(0);
    assert_eq!(p1.sent_count(), 2);
    assert_eq!(p2.sent_count(), 1);
}

#[test]
fn export_is_idempotent_for_equal_inputs() {
    let fixture = ExportFixture::new(ebgp_policy(300));
    let target = StubPeer::new("target");
    fixture.register(&target);

    let route = single_path_route(
        "10.18.0.0/16",
        PathBuilder::new(PathSource::Ebgp)
            .med(5)
            .as_path(&[100])
            .build(),
    );
    export_route(&fixture.ribout, 0, &route);
    export_route(&fixture.ribout, 0, &route);
    fixture.sender.process_partition(0);

    let sent = target.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].attr, sent[1].attr);
    assert_eq!(sent[0].route_key, sent[1].route_key);
}
