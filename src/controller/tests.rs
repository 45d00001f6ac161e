use super::*;
use crate::activity::InteractionKind;
use crate::identity::MemoryIdentityService;
use crate::profile::{MemoryProfileStore, UserType};
use async_trait::async_trait;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok, assert_pending};

struct Harness {
    identity: Arc<MemoryIdentityService>,
    profiles: Arc<MemoryProfileStore>,
    controller: SessionController,
}

fn harness() -> Harness {
    let identity = Arc::new(MemoryIdentityService::new());
    let profiles = Arc::new(MemoryProfileStore::new());
    let controller =
        SessionController::start(identity.clone(), profiles.clone(), SessionConfig::default());
    Harness {
        identity,
        profiles,
        controller,
    }
}

fn donor(id: &str, first_name: &str) -> NewProfile {
    NewProfile {
        id: id.to_string(),
        email: format!("{}@example.com", first_name.to_lowercase()),
        first_name: first_name.to_string(),
        last_name: "Okafor".to_string(),
        user_type: UserType::Donor,
        avatar_url: None,
        username: None,
    }
}

fn student_request(email: &str, username: &str) -> SignUpRequest {
    SignUpRequest {
        email: email.to_string(),
        password: "secret123".to_string(),
        first_name: "Bea".to_string(),
        last_name: "Stone".to_string(),
        user_type: UserType::Student,
        username: Some(username.to_string()),
    }
}

async fn wait_until(
    controller: &SessionController,
    predicate: impl Fn(&AuthView) -> bool,
) -> AuthView {
    let mut rx = controller.subscribe();
    let view = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|view| predicate(view)))
        .await
        .expect("timed out waiting for auth state")
        .expect("controller went away")
        .clone();
    view
}

/// Register a donor with a profile row and sign them in
async fn signed_in_donor(h: &Harness, email: &str, first_name: &str) -> String {
    let user_id = h.identity.register(email, "secret123");
    h.profiles.insert(donor(&user_id, first_name));
    h.controller.ready().await;
    assert_ok!(h.controller.sign_in(email, "secret123").await);
    wait_until(&h.controller, |v| v.profile.is_some()).await;
    user_id
}

#[tokio::test]
async fn test_initializes_signed_out_without_session() {
    let h = harness();

    let view = h.controller.ready().await;
    assert_eq!(view.phase, AuthPhase::Unauthenticated);
    assert!(!view.is_authenticated);
    assert!(!view.is_loading);
    assert_eq!(h.identity.get_session_calls(), 1);
}

#[tokio::test]
async fn test_initializes_with_existing_session() {
    let identity = Arc::new(MemoryIdentityService::new());
    let profiles = Arc::new(MemoryProfileStore::new());
    let user_id = identity.register("ann@example.com", "secret123");
    profiles.insert(donor(&user_id, "Ann"));
    assert_ok!(identity.sign_in("ann@example.com", "secret123").await);

    let controller =
        SessionController::start(identity.clone(), profiles.clone(), SessionConfig::default());

    let view = controller.ready().await;
    assert_eq!(view.phase, AuthPhase::Authenticated);
    assert_eq!(view.user_id(), Some(user_id.as_str()));

    let view = wait_until(&controller, |v| v.profile.is_some()).await;
    assert!(!view.is_loading);
    assert_eq!(view.display_name().as_deref(), Some("Ann Okafor"));
}

#[tokio::test(start_paused = true)]
async fn test_initialization_gives_up_after_timeout() {
    let identity = Arc::new(MemoryIdentityService::new());
    identity.set_latency(Duration::from_secs(3600));
    let controller = SessionController::start(
        identity.clone(),
        Arc::new(MemoryProfileStore::new()),
        SessionConfig::default(),
    );

    let started = Instant::now();
    let view = controller.ready().await;

    assert_eq!(view.phase, AuthPhase::Unauthenticated);
    assert!(!view.is_loading);
    assert_eq!(started.elapsed(), Duration::from_secs(8));
}

#[tokio::test]
async fn test_sign_in_is_applied_through_notification() {
    let h = harness();
    let user_id = h.identity.register("ann@example.com", "secret123");
    h.profiles.insert(donor(&user_id, "Ann"));
    h.controller.ready().await;

    let session = assert_ok!(h.controller.sign_in("ann@example.com", "secret123").await);
    assert_eq!(session.user_id(), Some(user_id.as_str()));

    let view = wait_until(&h.controller, |v| v.profile.is_some()).await;
    assert!(view.is_authenticated);
    assert_eq!(view.user_id(), Some(user_id.as_str()));
    assert_eq!(view.user_type(), Some(UserType::Donor));
}

#[tokio::test]
async fn test_failed_sign_in_leaves_state_untouched() {
    let h = harness();
    h.identity.register("ann@example.com", "secret123");
    h.controller.ready().await;

    let err = assert_err!(h.controller.sign_in("ann@example.com", "wrong-pass").await);
    assert_eq!(err, AuthError::validation("Invalid login credentials"));

    let view = h.controller.snapshot();
    assert_eq!(view.phase, AuthPhase::Unauthenticated);
    assert!(view.session.is_none());
}

#[tokio::test]
async fn test_sign_in_input_is_checked_before_provider_call() {
    let h = harness();
    h.controller.ready().await;

    let err = assert_err!(h.controller.sign_in("not-an-email", "secret123").await);
    assert_eq!(err, AuthError::validation("Please enter a valid email address"));
    let err = assert_err!(h.controller.sign_in("ann@example.com", "").await);
    assert_eq!(err, AuthError::validation("Password is required"));

    assert_eq!(h.identity.sign_in_calls(), 0);
}

#[tokio::test]
async fn test_authenticated_tracks_current_session_user() {
    let h = harness();
    let user_id = h.identity.register("ann@example.com", "secret123");
    h.controller.ready().await;

    let session = h.identity.sign_in_elsewhere("ann@example.com").unwrap();
    let view = wait_until(&h.controller, |v| v.is_authenticated).await;
    assert_eq!(view.user_id(), Some(user_id.as_str()));

    // A session without a user does not count as signed in
    let anonymous = Session {
        user: None,
        ..session.clone()
    };
    h.identity
        .push_change(SessionChange::new(ChangeKind::UserUpdated, Some(anonymous)));
    let view = wait_until(&h.controller, |v| v.session.is_some() && !v.is_authenticated).await;
    assert_eq!(view.user_id(), None);
    assert!(view.profile.is_none());

    h.identity
        .push_change(SessionChange::new(ChangeKind::SignedIn, Some(session)));
    let view = wait_until(&h.controller, |v| v.is_authenticated).await;
    assert_eq!(view.is_authenticated, view.user_id().is_some());

    h.identity.push_change(SessionChange::signed_out());
    let view = wait_until(&h.controller, |v| v.session.is_none()).await;
    assert!(!view.is_authenticated);
    assert_eq!(view.phase, AuthPhase::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn test_stale_profile_is_discarded_after_user_switch() {
    let h = harness();
    let ann = h.identity.register("ann@example.com", "secret123");
    let bob = h.identity.register("bob@example.com", "secret123");
    h.profiles.insert(donor(&ann, "Ann"));
    h.profiles.insert(donor(&bob, "Bob"));
    h.profiles.set_fetch_delay(Duration::from_secs(10));
    h.controller.ready().await;

    assert_ok!(h.controller.sign_in("ann@example.com", "secret123").await);
    wait_until(&h.controller, |v| v.user_id() == Some(ann.as_str())).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.identity.sign_in_elsewhere("bob@example.com").unwrap();
    wait_until(&h.controller, |v| v.user_id() == Some(bob.as_str())).await;

    // Ann's fetch has resolved by now, Bob's has not
    tokio::time::sleep(Duration::from_secs(6)).await;
    let view = h.controller.snapshot();
    assert_eq!(view.user_id(), Some(bob.as_str()));
    assert!(view.profile.is_none());
    assert!(view.is_loading);

    let view = wait_until(&h.controller, |v| v.profile.is_some()).await;
    assert_eq!(view.profile.unwrap().id, bob);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_session_for_same_user_fetches_profile_once() {
    let h = harness();
    let user_id = h.identity.register("ann@example.com", "secret123");
    h.profiles.insert(donor(&user_id, "Ann"));
    h.profiles.set_fetch_delay(Duration::from_secs(1));
    h.controller.ready().await;

    let session = h.identity.sign_in_elsewhere("ann@example.com").unwrap();
    h.identity
        .push_change(SessionChange::new(ChangeKind::SignedIn, Some(session.clone())));
    wait_until(&h.controller, |v| v.profile.is_some()).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.profiles.fetch_calls(), 1);

    // Cached profile for the same user is reused
    h.identity
        .push_change(SessionChange::new(ChangeKind::TokenRefreshed, Some(session)));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.profiles.fetch_calls(), 1);
    assert!(h.controller.snapshot().profile.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_focus_revalidates_only_after_idle_threshold() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;

    let outcome = h
        .controller
        .handle_signal(HostSignal::Interaction {
            kind: InteractionKind::Pointer,
        })
        .await;
    assert_eq!(outcome, SignalOutcome::Recorded);

    tokio::time::advance(Duration::from_secs(29)).await;
    let outcome = h.controller.handle_signal(HostSignal::Focus).await;
    assert_eq!(outcome, SignalOutcome::Skipped(SkipReason::RecentActivity));
    assert_eq!(h.identity.refresh_calls(), 0);

    tokio::time::advance(Duration::from_secs(1)).await;
    let outcome = h.controller.handle_signal(HostSignal::Focus).await;
    assert_eq!(
        outcome,
        SignalOutcome::Revalidated(RevalidateOutcome::Refreshed)
    );
    assert_eq!(h.identity.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_returning_to_hidden_tab_uses_focus_gate() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;

    let hide = HostSignal::VisibilityChanged {
        visibility: Visibility::Hidden,
    };
    let show = HostSignal::VisibilityChanged {
        visibility: Visibility::Visible,
    };

    assert_eq!(h.controller.handle_signal(hide.clone()).await, SignalOutcome::Recorded);
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(
        h.controller.handle_signal(show.clone()).await,
        SignalOutcome::Skipped(SkipReason::RecentActivity)
    );

    assert_eq!(h.controller.handle_signal(hide).await, SignalOutcome::Recorded);
    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(
        h.controller.handle_signal(show.clone()).await,
        SignalOutcome::Revalidated(RevalidateOutcome::Refreshed)
    );

    // Already visible: nothing to do
    assert_eq!(h.controller.handle_signal(show).await, SignalOutcome::Recorded);
    assert_eq!(h.identity.refresh_calls(), 1);
}

#[tokio::test]
async fn test_sign_out_clears_state_even_when_remote_fails() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    h.identity
        .fail_next_sign_out(AuthError::transient("socket closed"));
    let mut events = h.controller.events();

    h.controller.sign_out().await;

    let view = h.controller.snapshot();
    assert_eq!(view.phase, AuthPhase::Unauthenticated);
    assert!(!view.is_authenticated);
    assert!(view.session.is_none());
    assert!(view.profile.is_none());
    assert_eq!(assert_ok!(events.recv().await), AuthEvent::SignedOut);
    assert_eq!(h.identity.sign_out_calls(), 1);

    // The provider kept its session, but it must not come back on its own
    assert!(h.identity.current_session().is_some());
    assert_eq!(h.controller.revalidate().await, RevalidateOutcome::NoSession);
    assert_eq!(
        h.controller
            .handle_signal(HostSignal::StorageChanged {
                key: "sb-edufund-auth-token".to_string()
            })
            .await,
        SignalOutcome::Revalidated(RevalidateOutcome::NoSession)
    );
    assert!(!h.controller.snapshot().is_authenticated);
}

#[tokio::test]
async fn test_sign_in_after_local_sign_out_is_accepted() {
    let h = harness();
    let user_id = signed_in_donor(&h, "ann@example.com", "Ann").await;
    h.controller.sign_out().await;
    wait_until(&h.controller, |v| !v.is_authenticated).await;

    assert_ok!(h.controller.sign_in("ann@example.com", "secret123").await);
    let view = wait_until(&h.controller, |v| v.profile.is_some()).await;
    assert_eq!(view.user_id(), Some(user_id.as_str()));
}

#[tokio::test]
async fn test_sign_in_queued_before_sign_out_is_not_replayed() {
    let h = harness();
    let user_id = h.identity.register("ann@example.com", "secret123");
    h.profiles.insert(donor(&user_id, "Ann"));
    h.controller.ready().await;
    // The provider keeps its session, so only the SignedIn push is pending
    h.identity
        .fail_next_sign_out(AuthError::transient("socket closed"));

    // SignedIn is published but not yet delivered when sign_out runs
    assert_ok!(h.controller.sign_in("ann@example.com", "secret123").await);
    h.controller.sign_out().await;

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = h.controller.snapshot();
    assert_eq!(view.phase, AuthPhase::Unauthenticated);
    assert!(!view.is_authenticated);
    assert!(view.session.is_none());
    assert_eq!(h.profiles.fetch_calls(), 0);

    // Pushes made after the sign-out still reach the controller
    assert_ok!(h.controller.sign_in("ann@example.com", "secret123").await);
    let view = wait_until(&h.controller, |v| v.profile.is_some()).await;
    assert_eq!(view.user_id(), Some(user_id.as_str()));
}

#[tokio::test]
async fn test_storage_change_restores_session_after_confirmed_sign_out() {
    let h = harness();
    let user_id = signed_in_donor(&h, "ann@example.com", "Ann").await;
    h.controller.sign_out().await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(h.identity.current_session().is_none());
    assert!(!h.controller.snapshot().is_authenticated);

    // Another tab signs in and only the shared token changes
    h.identity.store_session_silently("ann@example.com").unwrap();
    let outcome = h
        .controller
        .handle_signal(HostSignal::StorageChanged {
            key: "sb-edufund-auth-token".to_string(),
        })
        .await;

    assert_eq!(
        outcome,
        SignalOutcome::Revalidated(RevalidateOutcome::Restored)
    );
    let view = wait_until(&h.controller, |v| v.profile.is_some()).await;
    assert_eq!(view.user_id(), Some(user_id.as_str()));
}

/// Delegates to the in-memory provider but never answers `sign_out`
struct StalledSignOut(MemoryIdentityService);

#[async_trait]
impl IdentityService for StalledSignOut {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        self.0.sign_in(email, password).await
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<String, AuthError> {
        self.0.sign_up(email, password).await
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        self.0.get_session().await
    }

    async fn refresh_session(&self) -> Result<Option<Session>, AuthError> {
        self.0.refresh_session().await
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.0.subscribe()
    }
}

#[tokio::test]
async fn test_sign_out_clears_state_before_remote_answers() {
    let provider = MemoryIdentityService::new();
    provider.register("ann@example.com", "secret123");
    let controller = SessionController::start(
        Arc::new(StalledSignOut(provider)),
        Arc::new(MemoryProfileStore::new()),
        SessionConfig::default(),
    );
    controller.ready().await;
    assert_ok!(controller.sign_in("ann@example.com", "secret123").await);
    wait_until(&controller, |v| v.is_authenticated).await;

    let mut sign_out = tokio_test::task::spawn(controller.sign_out());
    assert_pending!(sign_out.poll());

    let view = controller.snapshot();
    assert!(!view.is_authenticated);
    assert!(view.session.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_profile_is_retried_then_settles() {
    let h = harness();
    let user_id = h.identity.register("ann@example.com", "secret123");
    h.controller.ready().await;

    assert_ok!(h.controller.sign_in("ann@example.com", "secret123").await);
    let view = wait_until(&h.controller, |v| v.is_authenticated && !v.is_loading).await;

    assert!(view.profile.is_none());
    assert_eq!(view.user_id(), Some(user_id.as_str()));
    assert_eq!(view.display_name().as_deref(), Some("ann"));
    assert_eq!(h.profiles.fetch_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_profile_written_late_is_picked_up_by_retry() {
    let h = harness();
    let user_id = h.identity.register("ann@example.com", "secret123");
    h.profiles.insert_lagged(donor(&user_id, "Ann"), 2);
    h.controller.ready().await;

    assert_ok!(h.controller.sign_in("ann@example.com", "secret123").await);
    let view = wait_until(&h.controller, |v| v.profile.is_some()).await;

    assert_eq!(view.profile.unwrap().first_name, "Ann");
    assert_eq!(h.profiles.fetch_calls(), 3);
}

#[tokio::test]
async fn test_sign_up_rejects_taken_username_without_side_effects() {
    let h = harness();
    h.profiles.insert(NewProfile {
        username: Some("bea".to_string()),
        user_type: UserType::Student,
        ..donor("existing-user", "Bea")
    });
    h.controller.ready().await;

    let err = assert_err!(
        h.controller
            .sign_up(&student_request("bea@example.com", "Bea"))
            .await
    );

    assert_eq!(
        err,
        SignUpError::Rejected(AuthError::validation("Username already exists"))
    );
    assert_eq!(h.identity.sign_up_calls(), 0);
    assert_eq!(h.identity.account_count(), 0);
    assert_eq!(h.profiles.create_calls(), 0);
    assert_eq!(h.profiles.len(), 1);
}

#[tokio::test]
async fn test_sign_up_rejects_invalid_form() {
    let h = harness();
    h.controller.ready().await;

    let err = assert_err!(
        h.controller
            .sign_up(&student_request("bea@example.com", "b!"))
            .await
    );
    assert!(matches!(err, SignUpError::Rejected(AuthError::Validation(_))));
    assert_eq!(h.identity.sign_up_calls(), 0);
}

#[tokio::test]
async fn test_sign_up_creates_identity_and_profile() {
    let h = harness();
    h.controller.ready().await;

    let user_id = assert_ok!(
        h.controller
            .sign_up(&student_request("bea@example.com", "Bea_Stone"))
            .await
    );

    let profile = h.profiles.get(&user_id).unwrap();
    assert_eq!(profile.user_type, UserType::Student);
    assert_eq!(profile.username.as_deref(), Some("bea_stone"));
    assert_eq!(h.identity.account_count(), 1);
    // Sign-up does not sign the user in
    assert!(!h.controller.snapshot().is_authenticated);

    assert_ok!(h.controller.sign_in("bea@example.com", "secret123").await);
    let view = wait_until(&h.controller, |v| v.profile.is_some()).await;
    assert_eq!(view.user_type(), Some(UserType::Student));
}

#[tokio::test]
async fn test_partial_sign_up_can_be_completed() {
    let h = harness();
    h.profiles
        .fail_next_create(ProfileError::Transport("connection reset".to_string()));
    h.controller.ready().await;
    let request = student_request("bea@example.com", "bea");

    let err = assert_err!(h.controller.sign_up(&request).await);
    let user_id = err.orphaned_user_id().unwrap().to_string();
    assert!(matches!(
        err,
        SignUpError::ProfileIncomplete {
            source: ProfileError::Transport(_),
            ..
        }
    ));
    assert_eq!(h.identity.account_count(), 1);
    assert!(h.profiles.is_empty());

    let profile = assert_ok!(
        h.controller
            .complete_profile(&request.to_new_profile(&user_id))
            .await
    );
    assert_eq!(profile.id, user_id);
    assert_eq!(h.profiles.len(), 1);
}

#[tokio::test]
async fn test_revalidation_clears_revoked_session() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    let mut events = h.controller.events();

    h.identity.revoke_session();
    assert_eq!(h.controller.revalidate().await, RevalidateOutcome::Invalidated);

    let view = h.controller.snapshot();
    assert_eq!(view.phase, AuthPhase::Unauthenticated);
    assert!(view.session.is_none());
    assert!(view.profile.is_none());
    assert_eq!(assert_ok!(events.recv().await), AuthEvent::SessionExpired);
}

#[tokio::test]
async fn test_authoritative_refresh_error_clears_session() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;

    h.identity
        .fail_next_refresh(AuthError::invalidated("refresh token revoked"));
    assert_eq!(h.controller.revalidate().await, RevalidateOutcome::Invalidated);
    assert!(!h.controller.snapshot().is_authenticated);
}

#[tokio::test]
async fn test_transient_refresh_error_keeps_session() {
    let h = harness();
    let user_id = signed_in_donor(&h, "ann@example.com", "Ann").await;

    h.identity
        .fail_next_refresh(AuthError::transient("Failed to fetch"));
    assert_eq!(h.controller.revalidate().await, RevalidateOutcome::Deferred);

    let view = h.controller.snapshot();
    assert_eq!(view.phase, AuthPhase::Authenticated);
    assert_eq!(view.user_id(), Some(user_id.as_str()));
    assert!(view.profile.is_some());

    // Next attempt goes through
    assert_eq!(h.controller.revalidate().await, RevalidateOutcome::Refreshed);
}

#[tokio::test(start_paused = true)]
async fn test_storage_bursts_are_debounced() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    let signal = || HostSignal::StorageChanged {
        key: "sb-edufund-auth-token".to_string(),
    };

    let (first, second, third) = tokio::join!(
        h.controller.handle_signal(signal()),
        h.controller.handle_signal(signal()),
        h.controller.handle_signal(signal()),
    );

    assert_eq!(first, SignalOutcome::Debounced);
    assert_eq!(second, SignalOutcome::Debounced);
    assert_eq!(
        third,
        SignalOutcome::Revalidated(RevalidateOutcome::Refreshed)
    );
    assert_eq!(h.identity.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cross_tab_change_waits_for_in_flight_revalidation() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    h.identity.set_latency(Duration::from_secs(5));

    let (manual, cross_tab) = tokio::join!(h.controller.revalidate(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.controller
            .handle_signal(HostSignal::StorageChanged {
                key: "sb-edufund-auth-token".to_string(),
            })
            .await
    });

    assert_eq!(manual, RevalidateOutcome::Refreshed);
    assert_eq!(
        cross_tab,
        SignalOutcome::Revalidated(RevalidateOutcome::Refreshed)
    );
    assert_eq!(h.identity.refresh_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_focus_during_revalidation_is_not_queued() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    h.identity.set_latency(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_secs(31)).await;

    let (manual, focus) = tokio::join!(h.controller.revalidate(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.controller.handle_signal(HostSignal::Focus).await
    });

    assert_eq!(manual, RevalidateOutcome::Refreshed);
    assert_eq!(
        focus,
        SignalOutcome::Revalidated(RevalidateOutcome::AlreadyRunning)
    );
    assert_eq!(h.identity.refresh_calls(), 1);
}

#[tokio::test]
async fn test_unrelated_storage_key_is_ignored() {
    let h = harness();
    h.controller.ready().await;

    let outcome = h
        .controller
        .handle_signal(HostSignal::StorageChanged {
            key: "theme".to_string(),
        })
        .await;
    assert_eq!(outcome, SignalOutcome::Ignored);
    assert_eq!(h.identity.get_session_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_storage_change_restores_session_from_other_tab() {
    let h = harness();
    let user_id = h.identity.register("ann@example.com", "secret123");
    h.profiles.insert(donor(&user_id, "Ann"));
    h.controller.ready().await;

    h.identity.store_session_silently("ann@example.com").unwrap();
    let outcome = h
        .controller
        .handle_signal(HostSignal::StorageChanged {
            key: "sb-edufund-auth-token".to_string(),
        })
        .await;

    assert_eq!(
        outcome,
        SignalOutcome::Revalidated(RevalidateOutcome::Restored)
    );
    let view = wait_until(&h.controller, |v| v.profile.is_some()).await;
    assert_eq!(view.user_id(), Some(user_id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_check_only_runs_for_active_users() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;

    tokio::time::sleep(Duration::from_secs(299)).await;
    h.controller
        .handle_signal(HostSignal::Interaction {
            kind: InteractionKind::Key,
        })
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.identity.refresh_calls(), 1);

    // No interaction during the next window
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.identity.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_check_skips_hidden_tab() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    h.controller
        .handle_signal(HostSignal::VisibilityChanged {
            visibility: Visibility::Hidden,
        })
        .await;

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(h.identity.refresh_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_check_refreshes_expiring_session_of_idle_user() {
    // Sessions live shorter than the refresh margin, so every one is expiring
    let identity =
        Arc::new(MemoryIdentityService::new().with_session_ttl(Duration::from_secs(200)));
    let config = SessionConfig {
        periodic_activity_window_secs: 60,
        ..SessionConfig::default()
    };
    let controller =
        SessionController::start(identity.clone(), Arc::new(MemoryProfileStore::new()), config);
    identity.register("ann@example.com", "secret123");
    controller.ready().await;
    assert_ok!(controller.sign_in("ann@example.com", "secret123").await);
    let view = wait_until(&controller, |v| v.is_authenticated).await;
    let session = view.session.unwrap();
    assert!(session.expires_within(Utc::now(), Duration::from_secs(300)));

    // Idle far longer than the activity window when the tick fires
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(identity.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attached_signals_drive_revalidation() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    let (tx, rx) = mpsc::channel(8);
    h.controller.attach_signals(rx);
    let mut events = h.controller.events();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_ok!(tx.send(HostSignal::Focus).await);

    assert_eq!(assert_ok!(events.recv().await), AuthEvent::SessionRefreshed);
    assert_eq!(h.identity.refresh_calls(), 1);
}

#[tokio::test]
async fn test_update_profile_replaces_cached_profile() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;

    let updated = assert_ok!(
        h.controller
            .update_profile(&ProfileUpdate {
                first_name: Some("Annie".to_string()),
                ..ProfileUpdate::default()
            })
            .await
    );
    assert_eq!(updated.first_name, "Annie");
    assert_eq!(
        h.controller.snapshot().profile.map(|p| p.first_name),
        Some("Annie".to_string())
    );

    let err = assert_err!(h.controller.update_profile(&ProfileUpdate::default()).await);
    assert!(matches!(err, ControllerError::Profile(ProfileError::Validation(_))));
}

#[tokio::test]
async fn test_update_profile_requires_session() {
    let h = harness();
    h.controller.ready().await;

    let err = assert_err!(
        h.controller
            .update_profile(&ProfileUpdate {
                first_name: Some("Annie".to_string()),
                ..ProfileUpdate::default()
            })
            .await
    );
    assert_eq!(err, ControllerError::NotAuthenticated);
}

#[tokio::test]
async fn test_refresh_profile_refetches() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    let calls_before = h.profiles.fetch_calls();

    let profile = assert_ok!(h.controller.refresh_profile().await);
    assert_eq!(profile.map(|p| p.first_name), Some("Ann".to_string()));
    assert_eq!(h.profiles.fetch_calls(), calls_before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_profile_refresh_keeps_loaded_profile_visible() {
    let h = harness();
    signed_in_donor(&h, "ann@example.com", "Ann").await;
    h.profiles.set_fetch_delay(Duration::from_secs(5));

    let (refreshed, during) = tokio::join!(h.controller.refresh_profile(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.controller.snapshot()
    });

    assert!(!during.is_loading);
    assert_eq!(
        during.profile.map(|p| p.first_name),
        Some("Ann".to_string())
    );
    let refreshed = assert_ok!(refreshed);
    assert!(refreshed.is_some());
    assert!(!h.controller.snapshot().is_loading);
}

#[tokio::test(start_paused = true)]
async fn test_disposed_controller_ignores_late_results() {
    let h = harness();
    let user_id = h.identity.register("ann@example.com", "secret123");
    h.profiles.insert(donor(&user_id, "Ann"));
    h.profiles.set_fetch_delay(Duration::from_secs(10));
    h.controller.ready().await;
    assert_ok!(h.controller.sign_in("ann@example.com", "secret123").await);
    let view = wait_until(&h.controller, |v| v.is_authenticated).await;
    assert!(view.profile.is_none());

    h.controller.dispose();
    assert!(h.controller.is_disposed());

    // The pending fetch answers after dispose
    let ticket = FetchTicket {
        user_id: user_id.clone(),
        id: 1,
    };
    let profile = h.profiles.get(&user_id).unwrap();
    h.controller
        .inner
        .finish_profile_fetch(&ticket, FetchOutcome::Found(profile));
    tokio::time::sleep(Duration::from_secs(20)).await;

    let view = h.controller.snapshot();
    assert!(view.profile.is_none());
    assert_eq!(h.controller.revalidate().await, RevalidateOutcome::Disposed);
    assert_eq!(
        h.controller.handle_signal(HostSignal::Focus).await,
        SignalOutcome::Ignored
    );

    // Pushed changes are no longer observed either
    h.identity.push_change(SessionChange::signed_out());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.controller.snapshot().is_authenticated);
}
