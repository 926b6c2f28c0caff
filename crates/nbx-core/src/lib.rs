#![forbid(unsafe_code)]

pub mod error;
pub mod kernel;
pub mod layout;
pub mod pairlist;
pub mod params;
pub mod vec;

pub use error::{CoreError, CoreResult};
pub use kernel::{
    force_kernel_for, prune_kernel, AtomDataView, ForceKernelFlags, ForceKernelFn, ForceOutputs,
    KernelConsts, PairTables,
};
pub use layout::{force_kernel_launch_config, prune_kernel_launch_config, KernelLaunchConfig};
pub use pairlist::{Cj4Entry, ExclEntry, PairListHost, PairlistParams, SciEntry};
pub use params::{
    build_coulomb_force_table, pick_kernel_setup, CoulombForceTable, CoulombSetting, ElecKind,
    EnvOverrides, InteractionConstants, InteractionSettings, KernelSetup, LjCombinationRule,
    NonbondedParamsHost, VdwKind, VdwModifier, VdwSetting,
};
pub use vec::{pack_xq, Float2, Float3, Float4};
