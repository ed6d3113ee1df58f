/// Outcome of validating a command against a [`PolicyStore`](super::PolicyStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub ok: bool,
    pub reason: String,
}

impl Verdict {
    pub fn accept() -> Self {
        Self {
            ok: true,
            reason: "valid".into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        if self.ok { "ACCEPT" } else { "REJECT" }
    }
}
