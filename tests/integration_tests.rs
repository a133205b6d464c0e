//! Integration tests for the session engine and the master server
//!
//! Sessions run over the in-process transport; the master server tests use
//! real UDP sockets on the loopback interface.

use session::{
    JoinAttempt, JoinError, JoinProgress, LocalNetwork, NetworkSession, SessionConfig, SessionEndReason,
    SessionError, SessionEvent, SessionSettings, SessionState, SignedInGamer,
};
use shared::{GamerId, MachineId, NetworkSessionType, SendDataOptions, SessionQuery};
use std::net::SocketAddr;
use std::time::Duration;

fn host_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 3074))
}

fn client_addr(index: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 1, index], 4000))
}

fn create_host(network: &LocalNetwork, settings: SessionSettings, config: &SessionConfig) -> NetworkSession {
    NetworkSession::create(
        Box::new(network.peer(host_addr())),
        settings,
        config.clone(),
        vec![SignedInGamer::new("Host")],
    )
    .expect("host session")
}

/// Joins by polling the attempt while pumping the host.
fn join(
    network: &LocalNetwork,
    host: &mut NetworkSession,
    index: u8,
    profiles: Vec<SignedInGamer>,
) -> Result<NetworkSession, JoinError> {
    let mut attempt = JoinAttempt::start(
        Box::new(network.peer(client_addr(index))),
        host_addr(),
        host.config().clone(),
        profiles,
    )?;
    for _ in 0..50 {
        host.update().expect("host update");
        if let JoinProgress::Joined(session) = attempt.poll()? {
            return Ok(session);
        }
    }
    panic!("Join of client {} did not finish", index);
}

fn join_one(network: &LocalNetwork, host: &mut NetworkSession, index: u8) -> NetworkSession {
    join(network, host, index, vec![SignedInGamer::new(format!("Player{}", index))]).expect("join")
}

/// Runs a few frames on every session so in-flight messages settle.
fn pump(host: &mut NetworkSession, clients: &mut [NetworkSession]) {
    for _ in 0..5 {
        let _ = host.update();
        for client in clients.iter_mut() {
            let _ = client.update();
        }
    }
}

fn drain(session: &mut NetworkSession, id: GamerId) -> Vec<(Vec<u8>, GamerId)> {
    let mut buffer = [0u8; 256];
    let mut packets = Vec::new();
    while let (length, Some(sender)) = session.receive_data(id, &mut buffer).unwrap() {
        packets.push((buffer[..length].to_vec(), sender));
    }
    packets
}

fn system_link(max_gamers: u8) -> SessionSettings {
    SessionSettings::new(NetworkSessionType::SystemLink, max_gamers)
}

/// MEMBERSHIP TESTS
mod membership_tests {
    use super::*;

    #[test]
    fn joining_machines_get_distinct_ids() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let first = join_one(&network, &mut host, 1);
        let second = join_one(&network, &mut host, 2);
        let mut clients = vec![first, second];
        pump(&mut host, &mut clients);

        assert_eq!(clients[0].local_machine(), MachineId::new(1).unwrap());
        assert_eq!(clients[1].local_machine(), MachineId::new(2).unwrap());
        assert_eq!(clients[0].local_gamer_ids(), vec![GamerId::new(1).unwrap()]);
        assert_eq!(clients[1].local_gamer_ids(), vec![GamerId::new(2).unwrap()]);

        // Everybody ends up with the same roster
        for session in std::iter::once(&host).chain(clients.iter()) {
            assert_eq!(session.gamer_count(), 3);
            assert_eq!(session.machines().count(), 3);
            assert_eq!(session.host_gamer().unwrap().gamertag(), "Host");
        }
        assert_eq!(clients[1].gamer(GamerId::new(1).unwrap()).unwrap().gamertag(), "Player1");
    }

    #[test]
    fn split_screen_client_gets_an_id_per_profile() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let client = join(
            &network,
            &mut host,
            1,
            vec![SignedInGamer::new("Left"), SignedInGamer::new("Right")],
        )
        .unwrap();
        let mut clients = vec![client];
        pump(&mut host, &mut clients);

        assert_eq!(clients[0].local_gamer_ids().len(), 2);
        assert_eq!(host.gamer_count(), 3);
        assert_eq!(host.remote_gamers().count(), 2);
    }

    #[test]
    fn private_slots_are_honoured() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(4).with_private_slots(2), &config);
        assert_eq!(host.open_private_gamer_slots(), 2);
        assert_eq!(host.open_public_gamer_slots(), 1);

        let client = join(&network, &mut host, 1, vec![SignedInGamer::new("Friend").private()]).unwrap();
        let mut clients = vec![client];
        pump(&mut host, &mut clients);

        let friend = clients[0].local_gamer_ids()[0];
        assert!(host.gamer(friend).unwrap().is_private_slot());
        assert_eq!(host.open_private_gamer_slots(), 1);
        assert_eq!(host.open_public_gamer_slots(), 1);
    }

    #[test]
    fn full_session_denies_join() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(2), &config);
        let _first = join_one(&network, &mut host, 1);

        let result = join(&network, &mut host, 2, vec![SignedInGamer::new("Late")]);
        assert!(matches!(result, Err(JoinError::SessionFull)));
        assert_eq!(host.gamer_count(), 2);
        assert_eq!(host.machines().count(), 2);
    }

    #[test]
    fn playing_session_is_not_joinable_without_join_in_progress() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        host.start_game().unwrap();

        let result = join(&network, &mut host, 1, vec![SignedInGamer::new("Late")]);
        assert!(matches!(result, Err(JoinError::SessionNotJoinable)));

        host.set_allow_join_in_progress(true).unwrap();
        let late = join_one(&network, &mut host, 2);
        assert_eq!(late.state(), SessionState::Playing);
    }

    #[test]
    fn local_sessions_refuse_remote_machines() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, SessionSettings::new(NetworkSessionType::Local, 4), &config);

        let result = join(&network, &mut host, 1, vec![SignedInGamer::new("Remote")]);
        assert!(matches!(result, Err(JoinError::SessionNotJoinable)));
    }

    #[test]
    fn mismatched_application_is_refused() {
        let network = LocalNetwork::new();
        let mut host = create_host(&network, system_link(8), &SessionConfig::new("game-a"));

        let mut attempt = JoinAttempt::start(
            Box::new(network.peer(client_addr(1))),
            host_addr(),
            SessionConfig::new("game-b"),
            vec![SignedInGamer::new("Stranger")],
        )
        .unwrap();
        host.update().unwrap();
        assert!(matches!(attempt.poll(), Err(JoinError::ProtocolMismatch(_))));
    }

    #[test]
    fn join_without_host_times_out() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default().with_join_timeout(Duration::from_millis(50));

        let result = tokio_test::block_on(NetworkSession::join(
            Box::new(network.peer(client_addr(1))),
            host_addr(),
            config,
            vec![SignedInGamer::new("Lonely")],
        ));
        assert!(matches!(result, Err(JoinError::Timeout(_))));
    }

    #[test]
    fn leaving_client_is_removed_everywhere() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![join_one(&network, &mut host, 1), join_one(&network, &mut host, 2)];
        pump(&mut host, &mut clients);
        let leaving = clients.remove(0);
        let departed = leaving.local_gamer_ids()[0];
        assert!(clients[0].gamer(departed).is_some());
        while clients[0].poll_event().is_some() {}

        drop(leaving);
        pump(&mut host, &mut clients);

        assert!(host.gamer(departed).is_none());
        assert!(host.machine(MachineId::new(1).unwrap()).is_none());
        assert!(clients[0].gamer(departed).is_none());
        assert_eq!(clients[0].gamer_count(), 2);

        let events: Vec<SessionEvent> = std::iter::from_fn(|| clients[0].poll_event()).collect();
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::GamerLeft { id, .. } if *id == departed)));
    }

    #[test]
    fn host_ending_ends_every_client() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![join_one(&network, &mut host, 1), join_one(&network, &mut host, 2)];
        pump(&mut host, &mut clients);

        host.end();
        assert_eq!(host.state(), SessionState::Ended);
        assert!(matches!(host.update(), Err(SessionError::Ended)));

        for client in clients.iter_mut() {
            client.update().unwrap();
            assert_eq!(client.state(), SessionState::Ended);
            assert_eq!(client.end_reason(), Some(SessionEndReason::HostEndedSession));
            assert!(client.gamers().all(|gamer| gamer.has_left_session()));
        }
    }

    #[test]
    fn host_can_remove_a_machine() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![join_one(&network, &mut host, 1), join_one(&network, &mut host, 2)];
        pump(&mut host, &mut clients);
        let kicked = clients[0].local_gamer_ids()[0];

        assert!(matches!(
            clients[1].remove_machine(MachineId::new(1).unwrap()),
            Err(SessionError::NotHost(_))
        ));
        host.remove_machine(MachineId::new(1).unwrap()).unwrap();
        pump(&mut host, &mut clients);

        assert_eq!(clients[0].state(), SessionState::Ended);
        assert_eq!(clients[0].end_reason(), Some(SessionEndReason::RemovedByHost));
        assert!(clients[1].gamer(kicked).is_none());
        assert_eq!(host.gamer_count(), 2);
    }
}

/// GAME FLOW TESTS
mod game_flow_tests {
    use super::*;

    #[test]
    fn ready_start_and_end_game() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![join_one(&network, &mut host, 1), join_one(&network, &mut host, 2)];
        pump(&mut host, &mut clients);

        assert!(!host.is_everyone_ready());
        for client in clients.iter_mut() {
            for id in client.local_gamer_ids() {
                client.set_ready(id, true).unwrap();
            }
        }
        let host_gamer = host.local_gamer_ids()[0];
        host.local_gamer(host_gamer).unwrap().set_ready(true).unwrap();
        pump(&mut host, &mut clients);
        assert!(host.is_everyone_ready());
        assert!(clients.iter().all(NetworkSession::is_everyone_ready));

        // Only the host drives the state machine
        assert!(matches!(clients[0].start_game(), Err(SessionError::NotHost(_))));
        host.start_game().unwrap();
        pump(&mut host, &mut clients);
        assert_eq!(host.state(), SessionState::Playing);
        assert!(clients.iter().all(|client| client.state() == SessionState::Playing));

        let id = clients[0].local_gamer_ids()[0];
        assert!(matches!(
            clients[0].set_ready(id, false),
            Err(SessionError::InvalidOperation(_))
        ));
        assert!(host.start_game().is_err());

        host.end_game().unwrap();
        pump(&mut host, &mut clients);
        for session in std::iter::once(&host).chain(clients.iter()) {
            assert_eq!(session.state(), SessionState::Lobby);
            assert!(session.gamers().all(|gamer| !gamer.is_ready()));
        }
    }

    #[test]
    fn properties_are_host_only() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut client = join_one(&network, &mut host, 1);

        host.set_property(0, Some(3)).unwrap();
        assert_eq!(host.properties().get(0), Some(3));
        assert!(host.set_property(8, Some(1)).is_err());
        assert!(matches!(client.set_property(0, Some(1)), Err(SessionError::NotHost(_))));
        assert_eq!(host.public_info().properties.get(0), Some(3));
    }
}

/// DATA EXCHANGE TESTS
mod data_tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_other_gamer() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![join_one(&network, &mut host, 1), join_one(&network, &mut host, 2)];
        pump(&mut host, &mut clients);

        let sender = clients[0].local_gamer_ids()[0];
        clients[0]
            .send_data(sender, b"hello", SendDataOptions::RELIABLE_IN_ORDER, None)
            .unwrap();
        pump(&mut host, &mut clients);

        let host_gamer = host.local_gamer_ids()[0];
        assert_eq!(drain(&mut host, host_gamer), vec![(b"hello".to_vec(), sender)]);
        let other = clients[1].local_gamer_ids()[0];
        assert_eq!(drain(&mut clients[1], other), vec![(b"hello".to_vec(), sender)]);
        assert!(drain(&mut clients[0], sender).is_empty());
    }

    #[test]
    fn host_relays_one_copy_to_every_machine_but_the_sender() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![
            join_one(&network, &mut host, 1),
            join_one(&network, &mut host, 2),
            join_one(&network, &mut host, 3),
        ];
        pump(&mut host, &mut clients);

        let addrs = [host_addr(), client_addr(1), client_addr(2), client_addr(3)];
        let before: Vec<usize> = addrs.iter().map(|&addr| network.data_delivered_to(addr)).collect();

        let sender = clients[0].local_gamer_ids()[0];
        clients[0]
            .send_data(sender, b"once", SendDataOptions::RELIABLE, None)
            .unwrap();
        pump(&mut host, &mut clients);

        let delivered: Vec<usize> = addrs
            .iter()
            .zip(&before)
            .map(|(&addr, &count)| network.data_delivered_to(addr) - count)
            .collect();
        // Host gets the original, the sender gets nothing back
        assert_eq!(delivered, vec![1, 0, 1, 1]);
    }

    #[test]
    fn directed_packet_reaches_only_its_recipient() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![join_one(&network, &mut host, 1), join_one(&network, &mut host, 2)];
        pump(&mut host, &mut clients);

        let sender = clients[0].local_gamer_ids()[0];
        let recipient = clients[1].local_gamer_ids()[0];
        clients[0]
            .local_gamer(sender)
            .unwrap()
            .send_data_to(b"psst", SendDataOptions::RELIABLE, recipient)
            .unwrap();
        pump(&mut host, &mut clients);

        let host_gamer = host.local_gamer_ids()[0];
        assert!(drain(&mut host, host_gamer).is_empty());
        assert_eq!(drain(&mut clients[1], recipient), vec![(b"psst".to_vec(), sender)]);
    }

    #[test]
    fn ordered_packets_keep_their_order() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![join_one(&network, &mut host, 1)];
        pump(&mut host, &mut clients);

        let host_gamer = host.local_gamer_ids()[0];
        for value in 0u8..20 {
            host.send_data(host_gamer, &[value], SendDataOptions::RELIABLE_IN_ORDER, None)
                .unwrap();
        }
        pump(&mut host, &mut clients);

        let receiver = clients[0].local_gamer_ids()[0];
        let received: Vec<u8> = drain(&mut clients[0], receiver)
            .into_iter()
            .map(|(bytes, _)| bytes[0])
            .collect();
        assert_eq!(received, (0u8..20).collect::<Vec<u8>>());
    }

    #[test]
    fn invalid_sends_are_rejected() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut client = join_one(&network, &mut host, 1);
        let own = client.local_gamer_ids()[0];
        let remote = GamerId::new(0).unwrap();

        assert!(client.send_data(own, &[], SendDataOptions::RELIABLE, None).is_err());
        assert!(matches!(
            client.send_data(remote, b"x", SendDataOptions::RELIABLE, None),
            Err(SessionError::NotLocalGamer(_))
        ));
        assert!(client
            .send_data(own, b"x", SendDataOptions::RELIABLE, Some(GamerId::new(99).unwrap()))
            .is_err());
        assert!(matches!(
            client.send_data(own, b"x", SendDataOptions::from_bits(0xF0), None),
            Err(SessionError::SendOptions(_))
        ));
    }

    #[test]
    fn small_receive_buffer_keeps_the_packet() {
        let network = LocalNetwork::new();
        let config = SessionConfig::default();
        let mut host = create_host(&network, system_link(8), &config);
        let mut clients = vec![join_one(&network, &mut host, 1)];
        pump(&mut host, &mut clients);

        let host_gamer = host.local_gamer_ids()[0];
        host.send_data(host_gamer, &[7u8; 32], SendDataOptions::RELIABLE, None)
            .unwrap();
        pump(&mut host, &mut clients);

        let receiver = clients[0].local_gamer_ids()[0];
        let mut small = [0u8; 8];
        assert!(clients[0].receive_data(receiver, &mut small).is_err());
        let mut large = [0u8; 64];
        assert_eq!(
            clients[0].receive_data(receiver, &mut large).unwrap(),
            (32, Some(host_gamer))
        );
    }
}

/// DISCOVERY TESTS
mod discovery_tests {
    use super::*;
    use tokio::time::sleep;

    async fn keep_updating(session: &mut NetworkSession, rounds: usize) {
        for _ in 0..rounds {
            let _ = session.update();
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn lan_search_finds_matching_hosts() {
        let network = LocalNetwork::new();
        let config = SessionConfig::new("lan-game").with_discovery_timeout(Duration::from_millis(100));
        let mut host = create_host(&network, system_link(4), &config);

        let mut searcher = network.peer(client_addr(1));
        let query = SessionQuery::new(NetworkSessionType::SystemLink, 1);
        let (found, _) = tokio::join!(
            NetworkSession::find_local(&mut searcher, &config, &query),
            keep_updating(&mut host, 30)
        );
        let found = found.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host_endpoint, host_addr());
        assert_eq!(found[0].info.host_gamertag, "Host");
        assert_eq!(found[0].info.open_public_gamer_slots, 3);

        let joining = NetworkSession::join_available(
            Box::new(searcher),
            &found[0],
            config.clone(),
            vec![SignedInGamer::new("Finder")],
        );
        let (joined, _) = tokio::join!(joining, keep_updating(&mut host, 30));
        assert_eq!(joined.unwrap().gamer_count(), 2);
    }

    #[tokio::test]
    async fn lan_search_ignores_other_applications() {
        let network = LocalNetwork::new();
        let host_config = SessionConfig::new("game-a");
        let mut host = create_host(&network, system_link(4), &host_config);

        let config = SessionConfig::new("game-b").with_discovery_timeout(Duration::from_millis(60));
        let mut searcher = network.peer(client_addr(1));
        let query = SessionQuery::new(NetworkSessionType::SystemLink, 1);
        let (found, _) = tokio::join!(
            NetworkSession::find_local(&mut searcher, &config, &query),
            keep_updating(&mut host, 20)
        );
        assert!(found.unwrap().is_empty());
    }
}

/// MASTER SERVER TESTS
mod master_tests {
    use super::*;
    use master::network::MasterServer;
    use session::MasterServerClient;
    use shared::{NetworkSessionProperties, NetworkSessionPublicInfo, SessionGuid};
    use tokio::time::sleep;

    async fn start_master() -> SocketAddr {
        let mut server = MasterServer::new("127.0.0.1:0", 64, Duration::from_secs(60))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        addr
    }

    fn info() -> NetworkSessionPublicInfo {
        NetworkSessionPublicInfo {
            session_type: NetworkSessionType::PlayerMatch,
            properties: NetworkSessionProperties::new(),
            host_gamertag: "Remote".to_string(),
            max_gamers: 8,
            private_gamer_slots: 0,
            current_gamer_count: 1,
            open_private_gamer_slots: 0,
            open_public_gamer_slots: 7,
        }
    }

    #[tokio::test]
    async fn register_search_and_introduce() {
        let master = start_master().await;
        let host = MasterServerClient::bind(master).await.unwrap();
        let searcher = MasterServerClient::bind(master).await.unwrap();
        let config = SessionConfig::new("online-game");
        let guid = SessionGuid(42);
        let internal: SocketAddr = "192.168.0.20:3074".parse().unwrap();

        host.register_host(&config.app_id, guid, internal, info()).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let query = SessionQuery::new(NetworkSessionType::PlayerMatch, 1);
        let found = NetworkSession::find_online(&searcher, &config, &query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].guid, Some(guid));
        assert_eq!(found[0].internal_endpoint, Some(internal));
        assert_eq!(found[0].host_endpoint.port(), host.local_addr().unwrap().port());

        let ranked = SessionQuery::new(NetworkSessionType::Ranked, 1);
        assert!(NetworkSession::find_online(&searcher, &config, &ranked)
            .await
            .unwrap()
            .is_empty());

        let external = searcher
            .request_introduction(&config.app_id, guid, "192.168.0.30:3074".parse().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(external.port(), host.local_addr().unwrap().port());

        host.unregister_host(&config.app_id, guid).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(NetworkSession::find_online(&searcher, &config, &query)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn advertised_session_stays_registered_until_it_ends() {
        let master = start_master().await;
        let network = LocalNetwork::new();
        let config = SessionConfig::new("online-game").with_master_server(master);
        let settings = SessionSettings::new(NetworkSessionType::PlayerMatch, 4);
        let mut host = create_host(&network, settings, &config);

        host.advertise(MasterServerClient::bind(master).await.unwrap()).unwrap();
        assert!(host.is_advertised());

        let searcher = MasterServerClient::bind(master).await.unwrap();
        let query = SessionQuery::new(NetworkSessionType::PlayerMatch, 1);
        let mut found = Vec::new();
        for _ in 0..40 {
            host.update().unwrap();
            found = NetworkSession::find_online(&searcher, &config, &query).await.unwrap();
            if !found.is_empty() {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].guid, Some(host.guid()));
        assert_eq!(found[0].info.host_gamertag, "Host");

        host.end();
        assert!(!host.is_advertised());
        let mut remaining = found.len();
        for _ in 0..40 {
            sleep(Duration::from_millis(25)).await;
            remaining = NetworkSession::find_online(&searcher, &config, &query)
                .await
                .unwrap()
                .len();
            if remaining == 0 {
                break;
            }
        }
        assert_eq!(remaining, 0);
    }

    #[test]
    fn system_link_sessions_are_not_advertised() {
        tokio_test::block_on(async {
            let master: SocketAddr = "127.0.0.1:9".parse().unwrap();
            let network = LocalNetwork::new();
            let mut host = create_host(&network, system_link(4), &SessionConfig::default());
            let client = MasterServerClient::bind(master).await.unwrap();
            assert!(matches!(
                host.advertise(client),
                Err(SessionError::InvalidOperation(_))
            ));
        });
    }
}
