pub mod builder;
pub mod buildlog;
pub mod canon;
pub mod clparser;
mod densemap;
pub mod depfile;
pub mod depslog;
pub mod disk;
pub mod dyndep;
mod eval;
pub mod graph;
pub mod hash;
mod lexer;
pub mod parse;
pub mod plan;
pub mod scan;
mod scanner;
pub mod signal;
mod smallmap;
pub mod subprocess;
mod terminal;
pub mod trace;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
