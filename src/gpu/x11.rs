//! Thin Xlib wrapper
//!
//! The helper talks to the X server that owns the shared pixmaps: it creates
//! the per-monitor pixmaps, tags them so the display server can recognise
//! them, and drains the connection's event queue from the main loop. Xlib
//! and GLX are loaded at run time through `x11-dl`, so the binary starts on
//! machines without a GL stack and fails with a diagnostic instead of a
//! linker error.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::raw::{c_char, c_int, c_ulong};
use std::ptr;

use thiserror::Error;
use x11_dl::xlib::{self, Xlib};

#[derive(Debug, Error)]
pub enum X11Error {
    #[error("libX11 unavailable: {0}")]
    Load(String),

    #[error("cannot open display")]
    OpenDisplay,

    #[error("XCreateImage failed")]
    CreateImage,
}

/// One open Xlib connection plus the defaults the helper needs.
pub struct X11Display {
    xlib: Xlib,
    display: *mut xlib::Display,
    screen: c_int,
    root: c_ulong,
    visual: *mut xlib::Visual,
    gc: xlib::GC,
}

impl X11Display {
    /// Open the display named by `DISPLAY`.
    pub fn open() -> Result<Self, X11Error> {
        let xlib = Xlib::open().map_err(|e| X11Error::Load(e.to_string()))?;
        // SAFETY: Xlib is loaded; a null name selects $DISPLAY.
        let display = unsafe { (xlib.XOpenDisplay)(ptr::null()) };
        if display.is_null() {
            return Err(X11Error::OpenDisplay);
        }
        // SAFETY: display is a live connection.
        let (screen, root, visual, gc) = unsafe {
            let screen = (xlib.XDefaultScreen)(display);
            (
                screen,
                (xlib.XRootWindow)(display, screen),
                (xlib.XDefaultVisual)(display, screen),
                (xlib.XDefaultGC)(display, screen),
            )
        };
        Ok(Self {
            xlib,
            display,
            screen,
            root,
            visual,
            gc,
        })
    }

    pub fn raw(&self) -> *mut xlib::Display {
        self.display
    }

    pub fn screen(&self) -> c_int {
        self.screen
    }

    pub fn root(&self) -> c_ulong {
        self.root
    }

    /// `XFree`, needed by the GLX layer for config arrays.
    pub fn xfree(&self) -> unsafe extern "C" fn(*mut std::os::raw::c_void) -> c_int {
        self.xlib.XFree
    }

    /// Descriptor of the X connection, for the event loop's wait set.
    pub fn connection_fd(&self) -> RawFd {
        // SAFETY: display is live.
        unsafe { (self.xlib.XConnectionNumber)(self.display) }
    }

    /// Whether the server advertises the named extension.
    pub fn has_extension(&self, name: &str) -> bool {
        let Ok(cname) = CString::new(name) else {
            return false;
        };
        let mut major_opcode = 0;
        let mut first_event = 0;
        let mut first_error = 0;
        // SAFETY: cname outlives the call; out params are plain ints.
        unsafe {
            (self.xlib.XQueryExtension)(
                self.display,
                cname.as_ptr(),
                &mut major_opcode,
                &mut first_event,
                &mut first_error,
            ) != 0
        }
    }

    pub fn create_pixmap(&self, width: u16, height: u16) -> c_ulong {
        // SAFETY: root is a valid drawable; depth 24 matches the tagged image.
        unsafe {
            (self.xlib.XCreatePixmap)(
                self.display,
                self.root,
                width as u32,
                height as u32,
                24,
            )
        }
    }

    pub fn free_pixmap(&self, pixmap: c_ulong) {
        // SAFETY: pixmap came from create_pixmap.
        unsafe {
            (self.xlib.XFreePixmap)(self.display, pixmap);
        }
    }

    /// Paint the recognition tag into pixels (0,0)..(3,3) of a fresh pixmap.
    ///
    /// The display server reads these back to match the imported pixmap to
    /// its own bookkeeping.
    pub fn tag_pixmap(
        &self,
        pixmap: c_ulong,
        magic: u32,
        con_id: u32,
        mon_id: u32,
    ) -> Result<(), X11Error> {
        let mut pixels = [0u32; 16];
        pixels[0] = magic;
        pixels[1] = con_id;
        pixels[2] = mon_id;

        // SAFETY: pixels outlives the XPutImage below; the image struct is
        // released with XFree so Xlib never frees our stack data.
        unsafe {
            let image = (self.xlib.XCreateImage)(
                self.display,
                self.visual,
                24,
                xlib::ZPixmap,
                0,
                pixels.as_mut_ptr() as *mut c_char,
                4,
                4,
                32,
                0,
            );
            if image.is_null() {
                return Err(X11Error::CreateImage);
            }
            (self.xlib.XPutImage)(self.display, pixmap, self.gc, image, 0, 0, 0, 0, 4, 4);
            (self.xlib.XFree)(image as *mut _);
        }
        Ok(())
    }

    pub fn flush(&self) {
        // SAFETY: display is live.
        unsafe {
            (self.xlib.XFlush)(self.display);
        }
    }

    /// Drain and discard queued X events.
    ///
    /// The helper never selects for input; the queue only carries errors and
    /// internal replies, but it must be emptied so the descriptor goes quiet.
    pub fn pump_events(&self) {
        // SAFETY: display is live; XEvent is plain data filled by Xlib.
        unsafe {
            while (self.xlib.XPending)(self.display) > 0 {
                let mut event: xlib::XEvent = std::mem::zeroed();
                (self.xlib.XNextEvent)(self.display, &mut event);
            }
        }
    }
}

impl Drop for X11Display {
    fn drop(&mut self) {
        // SAFETY: the connection is closed exactly once, at context teardown.
        unsafe {
            (self.xlib.XCloseDisplay)(self.display);
        }
    }
}
