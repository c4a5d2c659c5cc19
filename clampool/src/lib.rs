// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The host-facing boundary of the clampool plugin.
//!
//! The host loads this library, calls `get_plugin_extended_iface` and
//! talks to the engine exclusively through the returned function
//! table. Everything in here is translation: C strings in, verdict
//! codes and truncate-copied messages out. The engine itself lives in
//! `libclampool` and never sees a raw pointer.

use std::{
    ffi::{CStr, OsStr},
    os::unix::ffi::OsStrExt as _,
    path::Path,
    ptr, slice,
    sync::{Arc, Mutex},
};

use lazy_static::lazy_static;
use libc::{c_char, c_int, c_uint, c_void};
use tracing::{debug, error};

use libclampool::{Config, Engine, Session, Verdict};

pub mod logger;

/// Maximum length, including the terminating NUL, of error and log
/// messages exchanged with the host.
pub const MAX_STRING: usize = 512;

/// The plugin shortcut must begin with `avir_` and should match the
/// dynamic library's file name.
const PLUGIN_NAME: &str = "avir_clam";
const PLUGIN_DESCRIPTION: &str = "Clam AntiVirus scanning plugin";

/// The option names the host may set, in the order the configuration
/// snapshot reports them.
const CONFIG_OPTIONS: [&str; 3] = ["Address", "Port", "StartupTimeout"];

lazy_static! {
    static ref ENGINE: Engine = Engine::new(Config::default());
    static ref ERROR_MESSAGE: Mutex<String> = Mutex::new(String::new());
}

/// One name/value configuration entry, US-ASCII, NUL terminated.
#[repr(C)]
pub struct AvirPluginConfig {
    pub name: [c_char; 32],
    pub value: [c_char; 128],
}

const EMPTY_CONFIG: AvirPluginConfig = AvirPluginConfig { name: [0; 32], value: [0; 128] };

/// Identity block the host displays for the plugin.
#[repr(C)]
pub struct AvirPluginInfo {
    pub name: [c_char; 64],
    pub description: [c_char; 128],
    pub reserved: [c_char; 64],
    pub reserved2: c_int,
}

/// The function table handed to the host. Layout is fixed by the host
/// ABI; the four reserved slots must stay NULL.
#[repr(C)]
pub struct AvirPluginExtendedThreadIface {
    pub get_plugin_info: unsafe extern "C" fn(*mut AvirPluginInfo),
    pub get_error_message: unsafe extern "C" fn(*mut c_char, c_int),
    pub set_plugin_config: unsafe extern "C" fn(*const AvirPluginConfig) -> c_int,
    pub get_plugin_config: unsafe extern "C" fn() -> *mut AvirPluginConfig,
    pub free_plugin_config: unsafe extern "C" fn(*mut AvirPluginConfig),
    pub plugin_init: unsafe extern "C" fn(Option<logger::LogCallback>) -> c_int,
    pub plugin_close: unsafe extern "C" fn() -> c_int,
    pub reserved1: Option<unsafe extern "C" fn() -> c_int>,
    pub reserved2: Option<unsafe extern "C" fn() -> c_int>,
    pub reserved3: Option<unsafe extern "C" fn() -> c_int>,
    pub reserved4: Option<unsafe extern "C" fn() -> c_int>,
    pub plugin_thread_init: unsafe extern "C" fn(*mut *mut c_void) -> c_int,
    pub plugin_thread_close: unsafe extern "C" fn(*mut *mut c_void) -> c_int,
    pub plugin_thread_test_file: unsafe extern "C" fn(
        *mut c_void,
        *const c_char,
        *const c_char,
        *mut c_char,
        c_uint,
        *mut c_char,
        c_uint,
    ) -> c_int,
}

static PLUGIN_IFACE: AvirPluginExtendedThreadIface = AvirPluginExtendedThreadIface {
    get_plugin_info,
    get_error_message,
    set_plugin_config,
    get_plugin_config,
    free_plugin_config,
    plugin_init,
    plugin_close,
    reserved1: None,
    reserved2: None,
    reserved3: None,
    reserved4: None,
    plugin_thread_init,
    plugin_thread_close,
    plugin_thread_test_file,
};

/// The host's entry point: returns the function table and reports ABI
/// version 2.
///
/// # Safety
///
/// `version` must be null or point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn get_plugin_extended_iface(
    version: *mut c_uint,
) -> *const AvirPluginExtendedThreadIface {
    if !version.is_null() {
        *version = 2;
    }
    &PLUGIN_IFACE
}

unsafe extern "C" fn get_plugin_info(info: *mut AvirPluginInfo) {
    if info.is_null() {
        return;
    }
    let info = &mut *info;
    copy_cstr(&mut info.name, PLUGIN_NAME);
    copy_cstr(&mut info.description, PLUGIN_DESCRIPTION);
    info.reserved[0] = 0;
    info.reserved2 = 0;
}

unsafe extern "C" fn get_error_message(buffer: *mut c_char, bufsize: c_int) {
    if buffer.is_null() || bufsize <= 0 {
        return;
    }
    let message = ERROR_MESSAGE.lock().unwrap().clone();
    let dest = slice::from_raw_parts_mut(buffer, bufsize as usize);
    copy_cstr(dest, &message);
}

unsafe extern "C" fn set_plugin_config(config: *const AvirPluginConfig) -> c_int {
    if config.is_null() {
        return 0;
    }
    let mut saved = 0;
    let mut entry = config;
    // the host terminates the array with an empty-name entry
    while (*entry).name[0] != 0 {
        let name = cstr_field(&(*entry).name);
        let value = cstr_field(&(*entry).value);
        if ENGINE.set_option(&name, &value) {
            saved += 1;
        }
        entry = entry.add(1);
    }
    saved
}

unsafe extern "C" fn get_plugin_config() -> *mut AvirPluginConfig {
    let config = ENGINE.config();
    let mut entries = Box::new([EMPTY_CONFIG; 4]);
    for (i, name) in CONFIG_OPTIONS.iter().enumerate() {
        copy_cstr(&mut entries[i].name, name);
        copy_cstr(&mut entries[i].value, &config.option(name).unwrap_or_default());
    }
    // the last entry stays all zero as the terminator
    Box::into_raw(entries) as *mut AvirPluginConfig
}

unsafe extern "C" fn free_plugin_config(config: *mut AvirPluginConfig) {
    if config.is_null() {
        return;
    }
    drop(Box::from_raw(config as *mut [AvirPluginConfig; 4]));
}

unsafe extern "C" fn plugin_init(log_callback: Option<logger::LogCallback>) -> c_int {
    logger::set_callback(log_callback);
    logger::install();

    debug!("initializing Clam AntiVirus plugin");
    match ENGINE.init() {
        Ok(()) => 1,
        Err(err) => {
            set_error_message(&err.to_string());
            error!("{err:#}");
            0
        }
    }
}

unsafe extern "C" fn plugin_close() -> c_int {
    match ENGINE.close() {
        Ok(()) => 1,
        Err(err) => {
            error!("{err:#}");
            0
        }
    }
}

unsafe extern "C" fn plugin_thread_init(context: *mut *mut c_void) -> c_int {
    if context.is_null() {
        return 0;
    }
    *context = ptr::null_mut();

    match ENGINE.thread_init() {
        Ok(session) => {
            *context = Box::into_raw(Box::new(session)) as *mut c_void;
            1
        }
        Err(err) => {
            set_error_message(&err.to_string());
            error!("{err:#}");
            0
        }
    }
}

unsafe extern "C" fn plugin_thread_close(context: *mut *mut c_void) -> c_int {
    if context.is_null() || (*context).is_null() {
        return 0;
    }
    let session = Box::from_raw(*context as *mut Arc<Session>);
    *context = ptr::null_mut();

    match ENGINE.thread_close(&session) {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

unsafe extern "C" fn plugin_thread_test_file(
    context: *mut c_void,
    filename: *const c_char,
    _realname: *const c_char,
    _reserved: *mut c_char,
    _reserved_size: c_uint,
    vir_info: *mut c_char,
    vi_size: c_uint,
) -> c_int {
    if filename.is_null() || vir_info.is_null() {
        return Verdict::Error.code();
    }
    let path_bytes = CStr::from_ptr(filename).to_bytes();
    let path = Path::new(OsStr::from_bytes(path_bytes));
    let session = (context as *const Arc<Session>).as_ref();

    let (verdict, message) = ENGINE.test_file(session, path);
    copy_out(vir_info, vi_size, &message);
    verdict.code()
}

/// Remember the most recent initialization-class failure for
/// `get_error_message`, capped at the host's buffer size.
fn set_error_message(message: &str) {
    let mut message = String::from(message);
    if message.len() >= MAX_STRING {
        let mut cut = MAX_STRING - 1;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    *ERROR_MESSAGE.lock().unwrap() = message;
}

/// strncpy with a guaranteed NUL: copies as much of `src` as fits and
/// always terminates.
fn copy_cstr(dest: &mut [c_char], src: &str) {
    if dest.is_empty() {
        return;
    }
    let n = src.len().min(dest.len() - 1);
    for (d, s) in dest.iter_mut().zip(src.as_bytes()[..n].iter()) {
        *d = *s as c_char;
    }
    dest[n] = 0;
}

unsafe fn copy_out(buffer: *mut c_char, size: c_uint, message: &str) {
    if size == 0 {
        return;
    }
    let dest = slice::from_raw_parts_mut(buffer, size as usize);
    copy_cstr(dest, message);
}

fn cstr_field(field: &[c_char]) -> String {
    let bytes: Vec<u8> = field.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
