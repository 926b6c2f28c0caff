pub const KERNELS_SRC: &str = concat!(
    include_str!("kernels/common.cu"),
    include_str!("kernels/force.cu"),
    include_str!("kernels/prune.cu"),
    include_str!("kernels/gather.cu"),
);
