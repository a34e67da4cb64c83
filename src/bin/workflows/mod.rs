mod context;
mod maintenance;
mod stages;

pub(crate) use context::{install_interrupt_handler, Context};
pub(crate) use maintenance::{mapping_import, mapping_list, preflight};
pub(crate) use stages::{
    build_cmd, check, fetch_cmd, package_cmd, patch_cmd, publish_cmd, run_all,
};
