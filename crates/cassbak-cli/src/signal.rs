use std::sync::OnceLock;

use cassbak_core::cancel::CancelToken;

static TOKEN: OnceLock<CancelToken> = OnceLock::new();

/// Install SIGINT/SIGTERM handlers that trip `token`.
///
/// The first signal requests cooperative shutdown and restores the default
/// handler, so a second signal terminates immediately.
pub fn install(token: &CancelToken) {
    TOKEN.set(token.clone()).expect("signal handlers installed twice");
    // Safety: the handler only clones an Arc'd flag already stored in a
    // static and flips an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
    }
}

extern "C" fn handler(sig: libc::c_int) {
    if let Some(token) = TOKEN.get() {
        token.cancel();
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
