//! Process daemonization and the signal-driven wait primitive.
//!
//! The serving loop never polls. The listening socket is switched into
//! asynchronous mode with its readiness notification directed at the lowest
//! real-time signal, that signal and SIGTERM are blocked, and the daemon
//! parks in sigwait() until one of them arrives. Termination is therefore
//! always an explicit, unmaskable wakeup.

use std::io;
use std::os::fd::RawFd;
use std::path::Path;

/// Working directory for daemonized processes.
pub const WORKING_DIRECTORY: &str = "/run";

/// `fcntl` command to set the readiness-notification signal; the libc crate
/// does not expose it for linux-gnu targets (value from
/// `<asm-generic/fcntl.h>`).
const F_SETSIG: libc::c_int = 10;

fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Detach from the controlling terminal: chdir, double fork around setsid,
/// stdio onto /dev/null, a private mount namespace so the module tree
/// cannot be swapped out underneath us, umask 0.
///
/// Must be called before any threads are spawned.
pub fn daemonize(working_directory: &Path) -> io::Result<()> {
    std::env::set_current_dir(working_directory)?;

    // SAFETY: single-threaded at this point; this is the classic
    // fork/setsid/fork sequence, and the parents exit without running any
    // Rust cleanup.
    unsafe {
        match check(libc::fork())? {
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }
        match check(libc::fork())? {
            0 => {}
            _ => libc::_exit(0),
        }

        let devnull = check(libc::open(c"/dev/null".as_ptr(), libc::O_RDWR))?;
        check(libc::dup2(devnull, libc::STDIN_FILENO))?;
        check(libc::dup2(devnull, libc::STDOUT_FILENO))?;
        check(libc::dup2(devnull, libc::STDERR_FILENO))?;
        if devnull > libc::STDERR_FILENO {
            check(libc::close(devnull))?;
        }

        check(libc::unshare(libc::CLONE_NEWNS))?;
        libc::umask(0);
    }
    Ok(())
}

/// What a wakeup from [`SignalWait::wait`] means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A connection is pending on the listening socket.
    Connection,
    /// SIGTERM arrived; stop serving.
    Terminate,
}

/// The blocked-signal set the serving loop sleeps on.
pub struct SignalWait {
    mask: libc::sigset_t,
    io_signal: libc::c_int,
}

impl SignalWait {
    /// Block the I/O and termination signals process-wide and direct the
    /// listener's readiness notification at the I/O signal.
    ///
    /// Also arms SA_NOCLDWAIT on SIGCHLD so forked load workers never
    /// linger as zombies.
    pub fn install(fd: RawFd) -> io::Result<Self> {
        // SAFETY: plain signal-mask and fcntl plumbing on owned values; the
        // sigset is fully initialized by sigemptyset before use.
        unsafe {
            let io_signal = libc::SIGRTMIN();

            let mut mask: libc::sigset_t = std::mem::zeroed();
            check(libc::sigemptyset(&mut mask))?;
            check(libc::sigaddset(&mut mask, io_signal))?;
            check(libc::sigaddset(&mut mask, libc::SIGTERM))?;
            check(libc::sigprocmask(
                libc::SIG_SETMASK,
                &mask,
                std::ptr::null_mut(),
            ))?;

            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_flags = libc::SA_NOCLDWAIT | libc::SA_NOCLDSTOP;
            action.sa_sigaction = libc::SIG_DFL;
            check(libc::sigemptyset(&mut action.sa_mask))?;
            check(libc::sigaction(
                libc::SIGCHLD,
                &action,
                std::ptr::null_mut(),
            ))?;

            let flags = check(libc::fcntl(fd, libc::F_GETFL))?;
            check(libc::fcntl(fd, F_SETSIG, io_signal))?;
            check(libc::fcntl(
                fd,
                libc::F_SETFL,
                flags | libc::O_NONBLOCK | libc::O_ASYNC,
            ))?;
            check(libc::fcntl(fd, libc::F_SETOWN, libc::getpid()))?;

            Ok(Self { mask, io_signal })
        }
    }

    /// Park until a connection is pending or termination is requested.
    pub fn wait(&self) -> io::Result<Wakeup> {
        let mut received: libc::c_int = 0;
        // SAFETY: the mask was initialized in install(); sigwait only
        // writes the received signal number.
        let rc = unsafe { libc::sigwait(&self.mask, &mut received) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        if received == self.io_signal {
            Ok(Wakeup::Connection)
        } else if received == libc::SIGTERM {
            Ok(Wakeup::Terminate)
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected signal {received}"),
            ))
        }
    }
}

/// Result of [`fork_worker`].
pub enum Fork {
    Parent(libc::pid_t),
    Child,
}

/// Fork a request worker. The child starts with a cleared signal mask so it
/// can be terminated normally; it inherits the parent's cache mappings
/// read-only, with no copy.
pub fn fork_worker() -> io::Result<Fork> {
    // SAFETY: the serving loop is single-threaded, so fork() does not
    // strand any locks; the child only resets its signal mask.
    unsafe {
        match libc::fork() {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                let mut mask: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut mask);
                libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
                Ok(Fork::Child)
            }
            pid => Ok(Fork::Parent(pid)),
        }
    }
}
