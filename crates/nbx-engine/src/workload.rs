//! Step-level vocabulary shared by the data-management operations: which
//! atom range or pair list an operation addresses and which outputs the
//! current step asks for.

/// Range of the packed atom arrays an operation addresses. With a domain
/// decomposition the home atoms come first and the halo atoms after them;
/// without one, `Local` and `All` coincide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomLocality {
    Local,
    NonLocal,
    All,
}

impl AtomLocality {
    /// The pair list (and therefore stream) an atom range belongs to.
    pub fn interaction_locality(self) -> InteractionLocality {
        match self {
            AtomLocality::Local | AtomLocality::All => InteractionLocality::Local,
            AtomLocality::NonLocal => InteractionLocality::NonLocal,
        }
    }
}

/// Which of the two pair lists an operation addresses. Each locality owns
/// one stream; the local one also carries every shared upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InteractionLocality {
    Local,
    NonLocal,
}

/// What the current step computes beyond plain forces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepWorkload {
    pub compute_energies: bool,
    pub compute_virial: bool,
    /// Forces stay on the device for a follow-up reduction kernel; the
    /// copy-back skips the force transfer.
    pub use_gpu_f_buffer_ops: bool,
}
