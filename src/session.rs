/// Per-connection authentication state. Lives only in memory, keyed by the
/// transport connection; a leader change therefore forces a re-login.
#[derive(Debug, Clone, Default)]
pub struct Session {
    user: Option<String>,
}

impl Session {
    pub fn login(&mut self, user: &str) {
        self.user = Some(user.to_string());
    }

    pub fn logout(&mut self) {
        self.user = None;
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn is(&self, name: &str) -> bool {
        self.user.as_deref() == Some(name)
    }
}

#[test]
fn test_session_flow() {
    let mut session = Session::default();
    assert!(session.user().is_none());

    session.login("alice");
    assert!(session.is("alice"));
    assert!(!session.is("bob"));

    session.logout();
    assert!(session.user().is_none());
}
