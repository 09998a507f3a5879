const JWT_SOURCE: &str = include_str!("../src/auth/jwt.rs");
const GATE_SOURCE: &str = include_str!("../src/auth/gate.rs");
const WS_HANDLER_SOURCE: &str = include_str!("../src/ws/handler.rs");
const WS_TESTS_SOURCE: &str = include_str!("../src/ws/mod.rs");

#[test]
fn expired_jwts_are_rejected() {
    assert!(
        JWT_SOURCE.contains("rejects_expired_tokens"),
        "JWT unit coverage must reject expired access tokens"
    );
    assert!(
        JWT_SOURCE.contains("Algorithm::HS256"),
        "access tokens must be verified with HS256 only"
    );
}

#[test]
fn join_is_authenticated_before_the_connection_enters_a_room() {
    let authenticate = WS_HANDLER_SOURCE
        .find("authenticate_connect")
        .expect("join must authenticate the token");
    let acquire = WS_HANDLER_SOURCE.find("registry.acquire").expect("join must acquire the session");
    assert!(authenticate < acquire, "authentication must happen before the room is joined");

    assert!(
        WS_TESTS_SOURCE.contains("unauthorized_connect_is_rejected_and_never_joins_the_room"),
        "unauthorized connects must have regression coverage"
    );
}

#[test]
fn mutations_are_authorized_per_update_with_role_revalidation() {
    assert!(WS_HANDLER_SOURCE.contains("authorize_mutation"));
    assert!(GATE_SOURCE.contains("role_checked_at.elapsed() >= self.revalidate_after"));
    assert!(
        GATE_SOURCE.contains("stale_role_is_revalidated_and_revocation_is_reported"),
        "revocation after join must have regression coverage"
    );
    assert!(
        WS_TESTS_SOURCE.contains("viewer_update_is_refused_with_read_only_and_state_is_unchanged"),
        "viewer writes must have regression coverage"
    );
}
