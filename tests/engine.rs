mod common;

use std::collections::HashSet;

use chrono::Duration;
use tokio::task::JoinSet;

use common::{harness, harness_with, input, voter, CREATOR};
use poll_backend::clock::Clock;
use poll_backend::error::AppError;
use poll_backend::ledger::CastVote;
use poll_backend::lifecycle::SweepReport;
use poll_backend::models::{PollEdit, PollStatus, Purpose};
use poll_backend::services::CreatePoll;
use poll_backend::store::PollStore;
use poll_backend::EngineSettings;

#[tokio::test]
async fn seven_to_three_picks_an_a_voter_and_keeps_them() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    let (a, b) = (poll.options[0].id, poll.options[1].id);

    for n in 0..7 {
        h.vote(poll.poll.id, a, &voter(n)).await.unwrap();
    }
    for n in 7..10 {
        h.vote(poll.poll.id, b, &voter(n)).await.unwrap();
    }

    h.close();
    let ended = h.service.end_poll(poll.poll.id).await.unwrap();
    let winner = ended.winner.expect("a winner");
    assert_eq!(winner.option_id, a);
    let a_voters: HashSet<String> = (0..7).map(voter).collect();
    assert!(a_voters.contains(&winner.identity_phone));

    let again = h.service.select_winner(poll.poll.id).await.unwrap();
    assert_eq!(again, Some(winner.clone()));
    let ended_again = h.service.end_poll(poll.poll.id).await.unwrap();
    assert_eq!(ended_again.winner, Some(winner));
}

#[tokio::test]
async fn fresh_code_does_not_allow_a_second_vote() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    let phone = voter(1);

    h.vote(poll.poll.id, poll.options[0].id, &phone).await.unwrap();
    let err = h
        .vote(poll.poll.id, poll.options[1].id, &phone)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateVote));

    let tally = h.service.get_tally(poll.poll.id).await.unwrap();
    assert_eq!(tally.total, 1);
}

#[tokio::test]
async fn one_number_in_different_formats_votes_once() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;

    h.vote(poll.poll.id, poll.options[0].id, "01711234567")
        .await
        .unwrap();
    for phone in ["+8801711234567", "8801711234567", "+880 1711-234567"] {
        let err = h
            .vote(poll.poll.id, poll.options[1].id, phone)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateVote), "{phone}: {err:?}");
    }

    let tally = h.service.get_tally(poll.poll.id).await.unwrap();
    assert_eq!(tally.total, 1);
    let votes = h.store.votes(poll.poll.id).await.unwrap();
    assert_eq!(votes[0].identity_phone, "8801711234567");
    assert!(h
        .sink
        .sent()
        .iter()
        .all(|(to, _)| to == "8801711234567" || to == CREATOR));
}

#[tokio::test]
async fn code_for_one_poll_fails_on_another() {
    let h = harness();
    let first = h.active_poll(&["A", "B"]).await;
    let second = h.active_poll(&["C", "D"]).await;
    let phone = voter(1);

    let code = h.code(&phone, Purpose::CastVote, Some(first.poll.id)).await;
    let err = h
        .service
        .cast_vote(CastVote {
            poll_id: second.poll.id,
            option_id: second.options[0].id,
            phone_number: phone.clone(),
            code: code.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidVerification));

    // Still valid for the poll it was issued for.
    h.service
        .cast_vote(CastVote {
            poll_id: first.poll.id,
            option_id: first.options[0].id,
            phone_number: phone,
            code,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn sweep_ends_past_due_poll_with_one_winner() {
    let h = harness();
    let poll = h.active_poll(&["A", "B", "C"]).await;
    for n in 0..5 {
        h.vote(poll.poll.id, poll.options[n % 3].id, &voter(n))
            .await
            .unwrap();
    }

    assert_eq!(h.service.sweep_expired_polls().await.unwrap(), SweepReport::default());

    h.close();
    let report = h.service.sweep_expired_polls().await.unwrap();
    assert_eq!(report.ended, 1);
    assert_eq!(report.failed, 0);

    let details = h.store.poll(poll.poll.id).await.unwrap().unwrap();
    assert_eq!(details.poll.status, PollStatus::Ended);
    let votes = h.store.votes(poll.poll.id).await.unwrap();
    assert_eq!(votes.iter().filter(|vote| vote.is_winner).count(), 1);

    assert_eq!(h.service.sweep_expired_polls().await.unwrap(), SweepReport::default());
}

#[tokio::test]
async fn concurrent_votes_from_one_phone_record_once() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    let phone = voter(3);

    let mut tasks = JoinSet::new();
    for i in 0..8 {
        let code = h.code(&phone, Purpose::CastVote, Some(poll.poll.id)).await;
        let service = h.service.clone();
        let request = CastVote {
            poll_id: poll.poll.id,
            option_id: poll.options[i % 2].id,
            phone_number: phone.clone(),
            code,
        };
        tasks.spawn(async move { service.cast_vote(request).await });
    }

    let mut accepted = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert!(matches!(e, AppError::DuplicateVote), "unexpected {e:?}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(h.service.get_tally(poll.poll.id).await.unwrap().total, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_verifications_consume_a_code_once() {
    let h = harness();
    let phone = voter(4);
    let code = h.code(&phone, Purpose::AdminLogin, None).await;

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let service = h.service.clone();
        let (phone, code) = (phone.clone(), code.clone());
        tasks.spawn(async move {
            service
                .verify_challenge(&phone, &code, Purpose::AdminLogin, None)
                .await
        });
    }

    let mut accepted = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap().is_ok() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
}

#[tokio::test]
async fn tally_counts_every_option() {
    let h = harness();
    let poll = h.active_poll(&["A", "B", "C"]).await;
    let ids: Vec<i64> = poll.options.iter().map(|option| option.id).collect();

    for (n, option) in [0, 0, 0, 1, 1].into_iter().enumerate() {
        h.vote(poll.poll.id, ids[option], &voter(n)).await.unwrap();
    }

    let tally = h.service.get_tally(poll.poll.id).await.unwrap();
    assert_eq!(tally.total, 5);
    assert_eq!(tally.count(ids[0]), 3);
    assert_eq!(tally.count(ids[1]), 2);
    assert_eq!(tally.per_option.get(&ids[2]), Some(&0));
    assert_eq!(tally.per_option.values().sum::<i64>(), tally.total);
}

#[tokio::test]
async fn accepted_votes_are_broadcast_to_the_poll_channel() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    let mut updates = h.service.channels().subscribe(poll.poll.id);

    h.vote(poll.poll.id, poll.options[1].id, &voter(1))
        .await
        .unwrap();

    let update = updates.recv().await.unwrap();
    assert_eq!(update.poll_id, poll.poll.id);
    assert_eq!(update.option_id, poll.options[1].id);
    assert_eq!(update.total_votes, 1);
    assert_eq!(update.option_votes.get(&poll.options[1].id), Some(&1));

    // Rejected votes publish nothing.
    let _ = h.vote(poll.poll.id, poll.options[0].id, &voter(1)).await;
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn status_only_moves_forward() {
    let h = harness();
    let pending = h.pending_poll(&["A", "B"]).await;
    let id = pending.poll.id;
    assert_eq!(pending.poll.status, PollStatus::Pending);

    let err = h.service.end_poll(id).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidTransition { from: PollStatus::Pending, to: PollStatus::Ended }
    ));

    assert_eq!(h.service.approve_poll(id).await.unwrap().status, PollStatus::Active);
    let err = h.service.reject_poll(id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    h.close();
    h.service.end_poll(id).await.unwrap();
    let err = h.service.approve_poll(id).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidTransition { from: PollStatus::Ended, to: PollStatus::Active }
    ));

    let rejected = h.pending_poll(&["A", "B"]).await;
    h.service.reject_poll(rejected.poll.id).await.unwrap();
    assert!(h.service.approve_poll(rejected.poll.id).await.is_err());
    assert!(h.service.end_poll(rejected.poll.id).await.is_err());
}

#[tokio::test]
async fn votes_need_an_open_poll_and_a_real_option() {
    let h = harness();
    let pending = h.pending_poll(&["A", "B"]).await;
    let err = h
        .vote(pending.poll.id, pending.options[0].id, &voter(1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PollNotActive));

    let active = h.active_poll(&["A", "B"]).await;
    let err = h
        .vote(active.poll.id, pending.options[0].id, &voter(1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidOption));

    let err = h
        .service
        .issue_challenge(&voter(1), Purpose::CastVote, Some(404))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PollNotFound));

    // Past the end time but not yet swept.
    h.close();
    let err = h
        .vote(active.poll.id, active.options[0].id, &voter(2))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PollNotActive));
}

#[tokio::test]
async fn invalid_code_is_rejected_before_the_ledger() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    let err = h
        .service
        .cast_vote(CastVote {
            poll_id: poll.poll.id,
            option_id: poll.options[0].id,
            phone_number: voter(1),
            code: "000000".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidVerification));
    assert!(h.store.votes(poll.poll.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_codes_fail() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    let code = h.code(&voter(1), Purpose::CastVote, Some(poll.poll.id)).await;
    h.clock.advance(Duration::minutes(11));

    let err = h
        .service
        .cast_vote(CastVote {
            poll_id: poll.poll.id,
            option_id: poll.options[0].id,
            phone_number: voter(1),
            code,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidVerification));
}

#[tokio::test]
async fn winner_and_voters_are_notified_once() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    for n in 0..14 {
        h.vote(poll.poll.id, poll.options[0].id, &voter(n))
            .await
            .unwrap();
    }

    h.close();
    let winner = h.service.end_poll(poll.poll.id).await.unwrap().winner.unwrap();
    h.settle_background().await;
    h.service.select_winner(poll.poll.id).await.unwrap();
    h.settle_background().await;

    let results = h.sink.results();
    let winners: Vec<_> = results.iter().filter(|(_, won)| *won).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].0, winner.identity_phone);
    assert_eq!(results.iter().filter(|(_, won)| !*won).count(), 10);
}

#[tokio::test]
async fn poll_without_votes_ends_without_winner() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    h.close();
    let report = h.service.sweep_expired_polls().await.unwrap();
    assert_eq!(report.ended, 1);
    assert_eq!(report.winners_backfilled, 0);
    assert_eq!(h.service.select_winner(poll.poll.id).await.unwrap(), None);
}

#[tokio::test]
async fn early_end_draws_the_winner_after_the_end_time() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    h.vote(poll.poll.id, poll.options[0].id, &voter(1))
        .await
        .unwrap();

    let ended = h.service.end_poll(poll.poll.id).await.unwrap();
    assert_eq!(ended.poll.status, PollStatus::Ended);
    assert!(ended.winner.is_none());
    let err = h.service.select_winner(poll.poll.id).await.unwrap_err();
    assert!(matches!(err, AppError::PollStillOpen));

    h.close();
    let report = h.service.sweep_expired_polls().await.unwrap();
    assert_eq!(report.ended, 0);
    assert_eq!(report.winners_backfilled, 1);
    assert_eq!(
        h.store.winner(poll.poll.id).await.unwrap().unwrap().identity_phone,
        voter(1)
    );
}

#[tokio::test]
async fn reselection_replaces_the_winner_within_the_winning_option() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    for n in 0..6 {
        h.vote(poll.poll.id, poll.options[1].id, &voter(n))
            .await
            .unwrap();
    }
    h.vote(poll.poll.id, poll.options[0].id, &voter(6))
        .await
        .unwrap();

    h.close();
    h.service.end_poll(poll.poll.id).await.unwrap();
    let redrawn = h.service.reselect_winner(poll.poll.id).await.unwrap().unwrap();
    assert_eq!(redrawn.option_id, poll.options[1].id);

    let votes = h.store.votes(poll.poll.id).await.unwrap();
    let flagged: Vec<_> = votes.iter().filter(|vote| vote.is_winner).collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].id, redrawn.id);
}

#[tokio::test]
async fn direct_selection_ends_an_overdue_active_poll_first() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    h.vote(poll.poll.id, poll.options[0].id, &voter(1))
        .await
        .unwrap();

    h.close();
    let winner = h.service.select_winner(poll.poll.id).await.unwrap().unwrap();
    assert_eq!(winner.identity_phone, voter(1));
    let details = h.store.poll(poll.poll.id).await.unwrap().unwrap();
    assert_eq!(details.poll.status, PollStatus::Ended);

    let again = h.active_poll(&["A", "B"]).await;
    h.vote(again.poll.id, again.options[1].id, &voter(2))
        .await
        .unwrap();
    h.close();
    h.service.reselect_winner(again.poll.id).await.unwrap().unwrap();
    let details = h.store.poll(again.poll.id).await.unwrap().unwrap();
    assert_eq!(details.poll.status, PollStatus::Ended);
}

#[tokio::test]
async fn winner_ranking_lists_winning_voters_in_vote_order() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    let err = h.service.winner_ranking(poll.poll.id).await.unwrap_err();
    assert!(matches!(err, AppError::PollStillOpen));

    for n in 0..3 {
        h.vote(poll.poll.id, poll.options[0].id, &voter(n))
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(1));
    }
    h.vote(poll.poll.id, poll.options[1].id, &voter(9))
        .await
        .unwrap();

    h.close();
    h.service.sweep_expired_polls().await.unwrap();
    let ranking = h.service.winner_ranking(poll.poll.id).await.unwrap();

    assert_eq!(ranking.winning_option.unwrap().votes, 3);
    let ranks: Vec<usize> = ranking.winning_option_voters.iter().map(|v| v.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert!(ranking.winning_option_voters[0].phone_number.ends_with("000"));
    assert!(!ranking.winning_option_voters[0].phone_number.contains("0181"));
    assert!(ranking.winner.is_some());
}

#[tokio::test]
async fn invalid_definition_keeps_the_code_usable() {
    let h = harness();
    let code = h.code(CREATOR, Purpose::CreatePoll, None).await;
    let end_time = h.clock.now() + Duration::hours(1);

    let err = h
        .service
        .create_poll(CreatePoll {
            phone_number: CREATOR.into(),
            code: code.clone(),
            creator_name: None,
            poll: input("Only one?", &["A"], end_time),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let created = h
        .service
        .create_poll(CreatePoll {
            phone_number: CREATOR.into(),
            code,
            creator_name: None,
            poll: input("Two now?", &["A", "B"], end_time),
        })
        .await
        .unwrap();
    assert_eq!(created.poll.status, PollStatus::Pending);
    assert_eq!(created.options[0].color, "#C8102E");
    assert_eq!(created.options[1].color, "#00A651");
}

#[tokio::test]
async fn auto_activation_opens_polls_immediately() {
    let h = harness_with(EngineSettings {
        auto_activate_polls: true,
        ..EngineSettings::default()
    });
    let poll = h.pending_poll(&["A", "B"]).await;
    assert_eq!(poll.poll.status, PollStatus::Active);
    h.vote(poll.poll.id, poll.options[0].id, &voter(1))
        .await
        .unwrap();
}

#[tokio::test]
async fn polls_are_found_by_public_id_with_masked_winner() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;
    h.vote(poll.poll.id, poll.options[0].id, &voter(7))
        .await
        .unwrap();

    let found = h.service.find_poll(&poll.poll.public_id).await.unwrap();
    assert_eq!(found.poll.id, poll.poll.id);
    let by_id = h.service.find_poll(&poll.poll.id.to_string()).await.unwrap();
    assert_eq!(by_id, found);
    assert!(matches!(
        h.service.find_poll("nope").await.unwrap_err(),
        AppError::PollNotFound
    ));

    let open = h.service.public_poll(found.clone()).await.unwrap();
    assert_eq!(open.total_votes, 1);
    assert!(open.winner.is_none());

    h.close();
    h.service.sweep_expired_polls().await.unwrap();
    let closed = h.service.public_poll(found).await.unwrap();
    assert_eq!(closed.status, PollStatus::Ended);
    let winner = closed.winner.unwrap();
    assert_ne!(winner.phone_number, voter(7));
    assert!(winner.phone_number.ends_with("007"));
}

#[tokio::test]
async fn featured_lists_latest_open_and_closed() {
    let h = harness();
    let old = h.active_poll(&["A", "B"]).await;
    h.close();
    h.service.sweep_expired_polls().await.unwrap();
    let current = h.active_poll(&["C", "D"]).await;
    h.pending_poll(&["E", "F"]).await;

    let featured = h.service.featured_polls().await.unwrap();
    let ids: Vec<i64> = featured.iter().map(|poll| poll.id).collect();
    assert_eq!(ids, vec![current.poll.id, old.poll.id]);
}

#[tokio::test]
async fn edits_apply_until_the_poll_ends() {
    let h = harness();
    let poll = h.active_poll(&["A", "B"]).await;

    let edited = h
        .service
        .edit_poll(
            poll.poll.id,
            PollEdit {
                question: Some("  Renamed?  ".into()),
                ..PollEdit::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.poll.question, "Renamed?");

    h.close();
    h.service.end_poll(poll.poll.id).await.unwrap();
    let err = h
        .service
        .edit_poll(poll.poll.id, PollEdit::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}
