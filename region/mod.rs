// Region data consumed by the fitting engines. Everything here is read-only for the
// duration of a fit.
pub mod bundle;
pub mod store;
pub mod subset;

pub use bundle::{BundleError, RegionBundle, load_bundle};
pub use store::{
    AlleleStd, DenseRegionStore, EIGENVALUE_FLOOR, LdBlock, MatrixForm, RegionError, RegionStore,
    ScalingMode, VariantInfo,
};
pub use subset::{RegionSubset, chromosome_groups};
