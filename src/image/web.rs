//! Browser binding for a JavaScript module factory
//!
//! Drives an Emscripten-style factory: `factory(Module)` resolves to an
//! instance with `callMain(args)`. Pre-run hooks see the module's `FS`, and
//! a host `ProxyFs` is exposed to `PROXYFS` as a node-style fs object.

use super::{ImageConfig, ImageError, ImageFactory, ImageInstance, ModuleFs};
use crate::vfs::{Metadata, OpenOptions, ProxyFs};
use js_sys::{Array, Date, Function, Object, Promise, Reflect, Uint8Array};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

/// Node numeric open flags
const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;
const O_CREAT: u32 = 0o100;
const O_TRUNC: u32 = 0o1000;
const O_APPEND: u32 = 0o2000;

/// File type bits for stat modes
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

fn js_reason(value: &JsValue) -> String {
    if let Some(error) = value.dyn_ref::<js_sys::Error>() {
        return String::from(error.message());
    }
    value.as_string().unwrap_or_else(|| format!("{:?}", value))
}

fn get(target: &JsValue, key: &str) -> JsValue {
    Reflect::get(target, &JsValue::from_str(key)).unwrap_or(JsValue::UNDEFINED)
}

fn set(target: &JsValue, key: &str, value: &JsValue) -> Result<(), ImageError> {
    Reflect::set(target, &JsValue::from_str(key), value)
        .map(|_| ())
        .map_err(|e| ImageError::Instantiation {
            reason: format!("failed to set {}: {}", key, js_reason(&e)),
        })
}

/// Call `target.name(args...)`
fn invoke(target: &JsValue, name: &str, args: &Array) -> Result<JsValue, JsValue> {
    let method: Function = get(target, name)
        .dyn_into()
        .map_err(|_| JsValue::from_str(&format!("{} is not a function", name)))?;
    method.apply(target, args)
}

/// Rust errors thrown into JS carry a node-style `code` for PROXYFS
fn throw_io(error: io::Error) -> JsValue {
    let code = match error.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::NotADirectory => "ENOTDIR",
        io::ErrorKind::IsADirectory => "EISDIR",
        io::ErrorKind::DirectoryNotEmpty => "ENOTEMPTY",
        io::ErrorKind::InvalidInput => "EINVAL",
        _ => "EIO",
    };
    let js_error = js_sys::Error::new(&error.to_string());
    let _ = Reflect::set(&js_error, &JsValue::from_str("code"), &JsValue::from_str(code));
    js_error.into()
}

fn string_arg(value: &JsValue) -> String {
    value.as_string().unwrap_or_default()
}

fn open_options(flags: &JsValue) -> OpenOptions {
    if let Some(flags) = flags.as_string() {
        return OpenOptions::from_flags(&flags).unwrap_or_default();
    }
    let bits = flags.as_f64().unwrap_or(0.0) as u32;
    let access = bits & 0o3;
    OpenOptions::new()
        .read(access != O_WRONLY)
        .write(access == O_WRONLY || access == O_RDWR)
        .create(bits & O_CREAT != 0)
        .truncate(bits & O_TRUNC != 0)
        .append(bits & O_APPEND != 0)
}

fn stat_object(meta: &Metadata) -> JsValue {
    let kind = if meta.is_dir {
        S_IFDIR
    } else if meta.is_symlink {
        S_IFLNK
    } else {
        S_IFREG
    };
    let stat = Object::new();
    let fields: [(&str, JsValue); 13] = [
        ("dev", JsValue::from_f64(1.0)),
        ("ino", (meta.ino as f64).into()),
        ("mode", (kind | meta.mode as u32).into()),
        ("nlink", meta.nlink.into()),
        ("uid", meta.uid.into()),
        ("gid", meta.gid.into()),
        ("rdev", JsValue::from_f64(0.0)),
        ("size", (meta.size as f64).into()),
        ("blksize", JsValue::from_f64(4096.0)),
        ("blocks", ((meta.size as f64) / 512.0).ceil().into()),
        ("atime", Date::new(&meta.atime.into()).into()),
        ("mtime", Date::new(&meta.mtime.into()).into()),
        ("ctime", Date::new(&meta.ctime.into()).into()),
    ];
    for (key, value) in fields.iter() {
        let _ = Reflect::set(&stat, &JsValue::from_str(key), value);
    }
    stat.into()
}

fn time_arg(value: &JsValue) -> f64 {
    if let Some(date) = value.dyn_ref::<Date>() {
        return date.get_time();
    }
    // Numbers are seconds, as node's utimes takes them
    value.as_f64().map(|s| s * 1000.0).unwrap_or(0.0)
}

type MethodFn = dyn Fn(JsValue, JsValue, JsValue, JsValue, JsValue) -> Result<JsValue, JsValue>;
type Method = Box<MethodFn>;

fn method(
    f: impl Fn(JsValue, JsValue, JsValue, JsValue, JsValue) -> Result<JsValue, JsValue> + 'static,
) -> Method {
    Box::new(f)
}

/// Build the node-style fs object that PROXYFS calls into
///
/// The object's methods stay callable only while the returned closures live.
fn proxy_object(fs: Rc<dyn ProxyFs>) -> Result<(JsValue, Vec<Closure<MethodFn>>), ImageError> {
    let object: JsValue = Object::new().into();
    let mut methods: Vec<(&str, Method)> = Vec::new();

    let f = fs.clone();
    methods.push(("lstat", method(move |p, _, _, _, _| {
        f.lstat(&string_arg(&p)).map(|m| stat_object(&m)).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("stat", method(move |p, _, _, _, _| {
        f.stat(&string_arg(&p)).map(|m| stat_object(&m)).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("readdir", method(move |p, _, _, _, _| {
        let names = f.readdir(&string_arg(&p)).map_err(throw_io)?;
        Ok(names.iter().map(|n| JsValue::from_str(n)).collect::<Array>().into())
    })));
    let f = fs.clone();
    methods.push(("readFile", method(move |p, _, _, _, _| {
        let data = f.read_file(&string_arg(&p)).map_err(throw_io)?;
        Ok(Uint8Array::from(data.as_slice()).into())
    })));
    let f = fs.clone();
    methods.push(("writeFile", method(move |p, data, options, _, _| {
        let bytes = match data.as_string() {
            Some(text) => text.into_bytes(),
            None => Uint8Array::new(&data).to_vec(),
        };
        // A bare string is an encoding, not a flag
        let flag = get(&options, "flag").as_string();
        let path = string_arg(&p);
        let written = match flag {
            Some(flag) => f.write_file_with_flag(&path, &bytes, &flag),
            None => f.write_file(&path, &bytes),
        };
        written.map(|_| JsValue::UNDEFINED).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("mkdir", method(move |p, options, _, _, _| {
        let mode = options
            .as_f64()
            .or_else(|| get(&options, "mode").as_f64())
            .map(|m| m as u16);
        let path = string_arg(&p);
        let created = if get(&options, "recursive").as_bool() == Some(true) {
            f.mkdir_all(&path, mode)
        } else {
            f.mkdir(&path, mode)
        };
        created.map(|_| JsValue::UNDEFINED).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("rmdir", method(move |p, _, _, _, _| {
        f.rmdir(&string_arg(&p)).map(|_| JsValue::UNDEFINED).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("unlink", method(move |p, _, _, _, _| {
        f.unlink(&string_arg(&p)).map(|_| JsValue::UNDEFINED).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("rename", method(move |from, to, _, _, _| {
        f.rename(&string_arg(&from), &string_arg(&to))
            .map(|_| JsValue::UNDEFINED)
            .map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("readlink", method(move |p, _, _, _, _| {
        f.readlink(&string_arg(&p)).map(|t| JsValue::from_str(&t)).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("symlink", method(move |target, p, _, _, _| {
        f.symlink(&string_arg(&target), &string_arg(&p))
            .map(|_| JsValue::UNDEFINED)
            .map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("link", method(move |source, dest, _, _, _| {
        f.link(&string_arg(&source), &string_arg(&dest))
            .map(|_| JsValue::UNDEFINED)
            .map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("exists", method(move |p, _, _, _, _| {
        Ok(JsValue::from_bool(f.exists(&string_arg(&p))))
    })));
    let f = fs.clone();
    methods.push(("chmod", method(move |p, mode, _, _, _| {
        let mode = mode.as_f64().unwrap_or(0.0) as u16;
        f.chmod(&string_arg(&p), mode).map(|_| JsValue::UNDEFINED).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("chown", method(move |p, uid, gid, _, _| {
        let uid = uid.as_f64().unwrap_or(0.0) as u32;
        let gid = gid.as_f64().unwrap_or(0.0) as u32;
        f.chown(&string_arg(&p), uid, gid).map(|_| JsValue::UNDEFINED).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("truncate", method(move |p, len, _, _, _| {
        let len = len.as_f64().unwrap_or(0.0) as u64;
        f.truncate(&string_arg(&p), len).map(|_| JsValue::UNDEFINED).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("utimes", method(move |p, atime, mtime, _, _| {
        f.utimes(&string_arg(&p), time_arg(&atime), time_arg(&mtime))
            .map(|_| JsValue::UNDEFINED)
            .map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("open", method(move |p, flags, _, _, _| {
        f.open(&string_arg(&p), open_options(&flags)).map(JsValue::from).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("close", method(move |fd, _, _, _, _| {
        let fd = fd.as_f64().unwrap_or(-1.0) as u32;
        f.close(fd).map(|_| JsValue::UNDEFINED).map_err(throw_io)
    })));
    let f = fs.clone();
    methods.push(("read", method(move |fd, buffer, offset, length, position| {
        let fd = fd.as_f64().unwrap_or(-1.0) as u32;
        let buffer = Uint8Array::new(&buffer);
        let offset = offset.as_f64().unwrap_or(0.0) as u32;
        let length = length.as_f64().unwrap_or(0.0) as usize;
        let mut chunk = vec![0u8; length];
        let n = f.read(fd, &mut chunk, position.as_f64().map(|p| p as u64)).map_err(throw_io)?;
        buffer
            .subarray(offset, offset + n as u32)
            .copy_from(&chunk[..n]);
        Ok(JsValue::from(n as u32))
    })));
    let f = fs;
    methods.push(("write", method(move |fd, buffer, offset, length, position| {
        let fd = fd.as_f64().unwrap_or(-1.0) as u32;
        let buffer = Uint8Array::new(&buffer);
        let offset = offset.as_f64().unwrap_or(0.0) as u32;
        let length = length.as_f64().unwrap_or(buffer.length() as f64) as u32;
        let chunk = buffer.subarray(offset, offset + length).to_vec();
        let n = f.write(fd, &chunk, position.as_f64().map(|p| p as u64)).map_err(throw_io)?;
        Ok(JsValue::from(n as u32))
    })));

    let mut closures = Vec::with_capacity(methods.len());
    for (name, method) in methods {
        let closure = Closure::wrap(method);
        set(&object, name, closure.as_ref())?;
        closures.push(closure);
    }

    Ok((object, closures))
}

/// The module's `FS` object, as pre-run hooks see it
struct JsModuleFs {
    fs: JsValue,
    /// Proxy methods handed to mounts, kept for the instance's lifetime
    mounts: Rc<RefCell<Vec<Closure<MethodFn>>>>,
}

impl JsModuleFs {
    fn call(&self, name: &str, args: &Array) -> Result<JsValue, ImageError> {
        invoke(&self.fs, name, args).map_err(|e| ImageError::Io {
            message: format!("FS.{}: {}", name, js_reason(&e)),
        })
    }
}

impl ModuleFs for JsModuleFs {
    fn has_proxy_fs(&self) -> bool {
        let proxy = get(&get(&self.fs, "filesystems"), "PROXYFS");
        !proxy.is_undefined() && !proxy.is_null()
    }

    fn mkdir(&mut self, path: &str) -> Result<(), ImageError> {
        self.call("mkdir", &Array::of1(&JsValue::from_str(path)))
            .map(|_| ())
    }

    fn mount_proxy(
        &mut self,
        fs: Rc<dyn ProxyFs>,
        root: &str,
        mountpoint: &str,
    ) -> Result<(), ImageError> {
        let (object, closures) = proxy_object(fs)?;
        self.mounts.borrow_mut().extend(closures);

        let options: JsValue = Object::new().into();
        set(&options, "root", &JsValue::from_str(root))?;
        set(&options, "fs", &object)?;

        let proxyfs = get(&get(&self.fs, "filesystems"), "PROXYFS");
        self.call(
            "mount",
            &Array::of3(&proxyfs, &options, &JsValue::from_str(mountpoint)),
        )
        .map(|_| ())
    }

    fn chdir(&mut self, path: &str) -> Result<(), ImageError> {
        self.call("chdir", &Array::of1(&JsValue::from_str(path)))
            .map(|_| ())
    }
}

/// Image factory backed by a JavaScript module factory function
#[derive(Clone)]
pub struct JsImageFactory {
    factory: Function,
}

impl JsImageFactory {
    pub fn new(factory: Function) -> Self {
        Self { factory }
    }
}

/// Rust callbacks the module calls into
///
/// Dropping them releases what they capture (the process's stdio and the
/// mounted filesystem); JS calls after that throw.
#[allow(dead_code)]
struct Callbacks {
    print: Closure<dyn Fn(JsValue)>,
    print_err: Closure<dyn Fn(JsValue)>,
    stdin: Closure<dyn Fn() -> JsValue>,
    pre_run: Closure<dyn FnMut(JsValue)>,
    mounts: Rc<RefCell<Vec<Closure<MethodFn>>>>,
}

/// A loaded JavaScript module instance
pub struct JsImageInstance {
    instance: JsValue,
    _callbacks: Callbacks,
}

impl ImageFactory for JsImageFactory {
    type Instance = JsImageInstance;

    async fn instantiate(&self, config: ImageConfig) -> Result<JsImageInstance, ImageError> {
        let ImageConfig {
            this_program,
            no_exit_runtime,
            print,
            print_err,
            stdin,
            pre_run,
        } = config;

        let module: JsValue = Object::new().into();
        set(&module, "thisProgram", &JsValue::from_str(&this_program))?;
        set(&module, "noExitRuntime", &JsValue::from_bool(no_exit_runtime))?;

        // print/printErr receive one line at a time, newline stripped
        let print = Closure::wrap(Box::new(move |line: JsValue| {
            print(format!("{}\n", string_arg(&line)).as_bytes());
        }) as Box<dyn Fn(JsValue)>);
        set(&module, "print", print.as_ref())?;

        let print_err = Closure::wrap(Box::new(move |line: JsValue| {
            print_err(format!("{}\n", string_arg(&line)).as_bytes());
        }) as Box<dyn Fn(JsValue)>);
        set(&module, "printErr", print_err.as_ref())?;

        let stdin = Closure::wrap(Box::new(move || match stdin() {
            Some(byte) => JsValue::from(byte),
            None => JsValue::NULL,
        }) as Box<dyn Fn() -> JsValue>);
        set(&module, "stdin", stdin.as_ref())?;

        // Hooks run inside the factory; their failure is reported afterwards
        let hooks = Rc::new(RefCell::new(Some(pre_run)));
        let failure: Rc<RefCell<Option<ImageError>>> = Rc::new(RefCell::new(None));
        let hook_failure = failure.clone();
        let mounts = Rc::new(RefCell::new(Vec::new()));
        let hook_mounts = mounts.clone();
        let pre_run = Closure::wrap(Box::new(move |instance: JsValue| {
            let Some(hooks) = hooks.borrow_mut().take() else {
                return;
            };
            let mut fs = JsModuleFs {
                fs: get(&instance, "FS"),
                mounts: hook_mounts.clone(),
            };
            for hook in hooks {
                if let Err(e) = hook(&mut fs) {
                    *hook_failure.borrow_mut() = Some(e);
                    return;
                }
            }
        }) as Box<dyn FnMut(JsValue)>);
        set(&module, "preRun", &Array::of1(pre_run.as_ref()))?;

        let created = self
            .factory
            .call1(&JsValue::NULL, &module)
            .map_err(|e| ImageError::Instantiation {
                reason: js_reason(&e),
            })?;
        let instance = JsFuture::from(Promise::resolve(&created))
            .await
            .map_err(|e| ImageError::Instantiation {
                reason: js_reason(&e),
            })?;

        if let Some(e) = failure.borrow_mut().take() {
            return Err(ImageError::Hook {
                reason: e.to_string(),
            });
        }

        Ok(JsImageInstance {
            instance,
            _callbacks: Callbacks {
                print,
                print_err,
                stdin,
                pre_run,
                mounts,
            },
        })
    }
}

impl ImageInstance for JsImageInstance {
    async fn call_main(&mut self, argv: &[String]) -> Result<i32, ImageError> {
        // callMain supplies argv[0] itself from thisProgram
        let args: Array = argv
            .iter()
            .skip(1)
            .map(|a| JsValue::from_str(a))
            .collect();

        let result = invoke(&self.instance, "callMain", &Array::of1(&args))
            .map_err(|e| ImageError::Trap {
                reason: js_reason(&e),
            })?;
        let code = JsFuture::from(Promise::resolve(&result))
            .await
            .map_err(|e| ImageError::Trap {
                reason: js_reason(&e),
            })?;

        Ok(code.as_f64().unwrap_or(0.0) as i32)
    }
}
