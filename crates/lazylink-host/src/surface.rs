//! Headless implementation of the browser APIs a binary module imports: an object heap, a
//! document of elements, 2D canvas contexts, pointer events, intervals and a console.
//!
//! Objects cross into the module as `i32` handles; handle `0` is `undefined`. Strings travel as
//! `(ptr, len)` pairs in the module's memory.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use lazylink_runtime::{Exports, HostCall, ModuleContext, Value, WeakRegistry};

pub const CONSOLE_TARGET: &str = "lazylink::console";
pub const UNDEFINED: i32 = 0;

/// Export names of the host interface, in installation order.
pub const FUNCTIONS: &[&str] = &[
    "log",
    "string_new",
    "object_clone_ref",
    "object_drop_ref",
    "is_undefined",
    "debug_string",
    "throw",
    "window",
    "global_this",
    "document",
    "create_element",
    "get_element_by_id",
    "append_child",
    "set_id",
    "set_inner_html",
    "set_width",
    "set_height",
    "get_context",
    "instance_of",
    "set_fill_style",
    "begin_path",
    "rect",
    "clear_rect",
    "fill",
    "offset_x",
    "offset_y",
    "touch_x",
    "touch_y",
    "make_callback",
    "set_event_handler",
    "set_interval",
    "clear_interval",
    "random",
    "new_no_args",
    "call",
];

#[derive(Debug, Clone, PartialEq)]
pub enum HostObject {
    Undefined,
    Window,
    Document,
    Element(usize),
    Context2d(usize),
    Str(String),
    /// Constructed from source text; only `return this` does anything when called.
    Function { body: String },
    Callback(Callback),
    Event(PointerEvent),
}

impl HostObject {
    fn debug_string(&self, elements: &[Element]) -> String {
        match self {
            HostObject::Undefined => "undefined".to_string(),
            HostObject::Window => "[object Window]".to_string(),
            HostObject::Document => "[object HTMLDocument]".to_string(),
            HostObject::Element(idx) => match elements.get(*idx) {
                Some(el) => match &el.id {
                    Some(id) => format!("<{} id={id:?}>", el.tag),
                    None => format!("<{}>", el.tag),
                },
                None => "<detached>".to_string(),
            },
            HostObject::Context2d(_) => "[object CanvasRenderingContext2D]".to_string(),
            HostObject::Str(s) => format!("{s:?}"),
            HostObject::Function { body } => format!("function anonymous() {{ {body} }}"),
            HostObject::Callback(cb) => format!("Closure({}::{})", cb.module, cb.export),
            HostObject::Event(ev) => format!("{ev:?}"),
        }
    }
}

/// A function export of a binary module, invoked later by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    pub module: String,
    pub export: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerEvent {
    pub x: i32,
    pub y: i32,
    pub touch: bool,
}

impl PointerEvent {
    pub fn mouse(x: i32, y: i32) -> Self {
        Self { x, y, touch: false }
    }

    pub fn touch(x: i32, y: i32) -> Self {
        Self { x, y, touch: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    ClearRect(Rect),
    Fill { style: String, rects: Vec<Rect> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Canvas2d {
    pub fill_style: String,
    pub ops: Vec<DrawOp>,
    path: Vec<Rect>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub tag: String,
    pub id: Option<String>,
    pub inner_html: String,
    pub width: u32,
    pub height: u32,
    pub children: Vec<usize>,
    pub handlers: BTreeMap<String, Callback>,
    pub canvas: Option<Canvas2d>,
}

#[derive(Debug, Clone)]
struct Interval {
    id: i32,
    callback: Callback,
    period_ms: u64,
    next_due: u64,
}

#[derive(Debug, Default)]
struct State {
    heap: Vec<Option<Rc<HostObject>>>,
    free: Vec<usize>,
    elements: Vec<Element>,
    body: Vec<usize>,
    intervals: Vec<Interval>,
    next_interval: i32,
    now_ms: u64,
    console: Vec<String>,
}

impl State {
    fn alloc(&mut self, object: Rc<HostObject>) -> i32 {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.heap[idx] = Some(object);
                idx
            }
            None => {
                self.heap.push(Some(object));
                self.heap.len() - 1
            }
        };
        idx as i32 + 1
    }

    fn slot(&self, handle: i32) -> Result<Rc<HostObject>> {
        if handle == UNDEFINED {
            return Ok(Rc::new(HostObject::Undefined));
        }
        let idx = usize::try_from(handle - 1).with_context(|| format!("bad object handle {handle}"))?;
        self.heap
            .get(idx)
            .and_then(Option::clone)
            .with_context(|| format!("object handle {handle} is not live"))
    }

    fn release(&mut self, handle: i32) -> Result<()> {
        if handle == UNDEFINED {
            return Ok(());
        }
        let idx = usize::try_from(handle - 1).with_context(|| format!("bad object handle {handle}"))?;
        match self.heap.get_mut(idx) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free.push(idx);
                Ok(())
            }
            _ => bail!("object handle {handle} dropped twice"),
        }
    }

    fn element_index(&self, handle: i32) -> Result<usize> {
        match *self.slot(handle)? {
            HostObject::Element(idx) => Ok(idx),
            ref other => bail!("handle {handle} is {other:?}, not an element"),
        }
    }

    fn element_mut(&mut self, handle: i32) -> Result<&mut Element> {
        let idx = self.element_index(handle)?;
        self.elements
            .get_mut(idx)
            .with_context(|| format!("element {idx} does not exist"))
    }

    fn canvas_mut(&mut self, handle: i32) -> Result<&mut Canvas2d> {
        let idx = match *self.slot(handle)? {
            HostObject::Context2d(idx) => idx,
            ref other => bail!("handle {handle} is {other:?}, not a 2d context"),
        };
        self.elements
            .get_mut(idx)
            .and_then(|el| el.canvas.as_mut())
            .with_context(|| format!("element {idx} has no 2d context"))
    }

    fn event(&self, handle: i32) -> Result<PointerEvent> {
        match *self.slot(handle)? {
            HostObject::Event(ev) => Ok(ev),
            ref other => bail!("handle {handle} is {other:?}, not an event"),
        }
    }

    fn find_by_id(&self, id: &str) -> Option<usize> {
        self.elements
            .iter()
            .position(|el| el.id.as_deref() == Some(id))
    }
}

pub struct HostSurface {
    state: RefCell<State>,
    registry: RefCell<Option<WeakRegistry>>,
}

impl Default for HostSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSurface {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_interval: 1,
                ..State::default()
            }),
            registry: RefCell::new(None),
        }
    }

    /// Seeds the document with an element, as page markup would.
    pub fn with_element(self, tag: &str, id: &str) -> Self {
        {
            let mut state = self.state.borrow_mut();
            let idx = state.elements.len();
            state.elements.push(Element {
                tag: tag.to_owned(),
                id: Some(id.to_owned()),
                canvas: (tag == "canvas").then(Canvas2d::default),
                ..Element::default()
            });
            state.body.push(idx);
        }
        self
    }

    /// Exports every host function into the running unit and remembers its registry, through
    /// which callbacks reach binary module exports.
    pub fn install(self: &Rc<Self>, ctx: &mut ModuleContext<'_>) {
        *self.registry.borrow_mut() = Some(ctx.registry().downgrade());
        self.export_into(ctx.exports());
    }

    fn export_into(self: &Rc<Self>, exports: &Exports) {
        for &name in FUNCTIONS {
            let surface = Rc::clone(self);
            exports.set(
                name,
                Value::function(move |call, args| surface.invoke(name, call, args)),
            );
        }
    }

    fn invoke(&self, name: &str, call: &mut HostCall<'_>, args: &[Value]) -> Result<Vec<Value>> {
        let handle = |v: i32| -> Result<Vec<Value>> { Ok(vec![Value::I32(v)]) };
        let none = || -> Result<Vec<Value>> { Ok(Vec::new()) };
        match name {
            "log" => {
                let text = call.read_str(int(args, 0)?, int(args, 1)?)?;
                tracing::info!(target: CONSOLE_TARGET, "{text}");
                self.state.borrow_mut().console.push(text);
                none()
            }
            "string_new" => {
                let text = call.read_str(int(args, 0)?, int(args, 1)?)?;
                handle(self.alloc(HostObject::Str(text)))
            }
            "object_clone_ref" => {
                let mut state = self.state.borrow_mut();
                let object = state.slot(int(args, 0)?)?;
                handle(state.alloc(object))
            }
            "object_drop_ref" => {
                self.state.borrow_mut().release(int(args, 0)?)?;
                none()
            }
            "is_undefined" => {
                let object = self.state.borrow().slot(int(args, 0)?)?;
                handle(i32::from(*object == HostObject::Undefined))
            }
            "debug_string" => {
                let text = {
                    let state = self.state.borrow();
                    state.slot(int(args, 0)?)?.debug_string(&state.elements)
                };
                handle(self.alloc(HostObject::Str(text)))
            }
            "throw" => {
                let message = call.read_str(int(args, 0)?, int(args, 1)?)?;
                bail!("{message}")
            }
            "window" | "global_this" => handle(self.alloc(HostObject::Window)),
            "document" => {
                let object = self.state.borrow().slot(int(args, 0)?)?;
                if *object != HostObject::Window {
                    bail!("document requested from {object:?}");
                }
                handle(self.alloc(HostObject::Document))
            }
            "create_element" => {
                let tag = call.read_str(int(args, 1)?, int(args, 2)?)?;
                let mut state = self.state.borrow_mut();
                let idx = state.elements.len();
                let canvas = (tag == "canvas").then(Canvas2d::default);
                state.elements.push(Element {
                    tag,
                    canvas,
                    ..Element::default()
                });
                handle(state.alloc(Rc::new(HostObject::Element(idx))))
            }
            "get_element_by_id" => {
                let id = call.read_str(int(args, 1)?, int(args, 2)?)?;
                let mut state = self.state.borrow_mut();
                match state.find_by_id(&id) {
                    Some(idx) => handle(state.alloc(Rc::new(HostObject::Element(idx)))),
                    None => handle(UNDEFINED),
                }
            }
            "append_child" => {
                let parent = int(args, 0)?;
                let child_handle = int(args, 1)?;
                let mut state = self.state.borrow_mut();
                let child = state.element_index(child_handle)?;
                if *state.slot(parent)? == HostObject::Document {
                    state.body.push(child);
                } else {
                    state.element_mut(parent)?.children.push(child);
                }
                let object = state.slot(child_handle)?;
                handle(state.alloc(object))
            }
            "set_id" => {
                let id = call.read_str(int(args, 1)?, int(args, 2)?)?;
                self.state.borrow_mut().element_mut(int(args, 0)?)?.id = Some(id);
                none()
            }
            "set_inner_html" => {
                let html = call.read_str(int(args, 1)?, int(args, 2)?)?;
                self.state.borrow_mut().element_mut(int(args, 0)?)?.inner_html = html;
                none()
            }
            "set_width" | "set_height" => {
                let value = u32::try_from(int(args, 1)?).context("negative canvas size")?;
                let mut state = self.state.borrow_mut();
                let el = state.element_mut(int(args, 0)?)?;
                if name == "set_width" {
                    el.width = value;
                } else {
                    el.height = value;
                }
                none()
            }
            "get_context" => {
                let kind = call.read_str(int(args, 1)?, int(args, 2)?)?;
                let mut state = self.state.borrow_mut();
                let idx = state.element_index(int(args, 0)?)?;
                if kind != "2d" || state.elements[idx].canvas.is_none() {
                    return handle(UNDEFINED);
                }
                handle(state.alloc(Rc::new(HostObject::Context2d(idx))))
            }
            "instance_of" => {
                let class = call.read_str(int(args, 1)?, int(args, 2)?)?;
                let state = self.state.borrow();
                let object = state.slot(int(args, 0)?)?;
                let is = match (&*object, class.as_str()) {
                    (HostObject::Window, "Window") => true,
                    (HostObject::Element(_), "HTMLElement") => true,
                    (HostObject::Element(idx), "HTMLCanvasElement") => {
                        state.elements.get(*idx).is_some_and(|el| el.tag == "canvas")
                    }
                    (HostObject::Context2d(_), "CanvasRenderingContext2D") => true,
                    _ => false,
                };
                handle(i32::from(is))
            }
            "set_fill_style" => {
                let style = call.read_str(int(args, 1)?, int(args, 2)?)?;
                self.state.borrow_mut().canvas_mut(int(args, 0)?)?.fill_style = style;
                none()
            }
            "begin_path" => {
                self.state.borrow_mut().canvas_mut(int(args, 0)?)?.path.clear();
                none()
            }
            "rect" | "clear_rect" => {
                let rect = Rect {
                    x: float(args, 1)?,
                    y: float(args, 2)?,
                    w: float(args, 3)?,
                    h: float(args, 4)?,
                };
                let mut state = self.state.borrow_mut();
                let canvas = state.canvas_mut(int(args, 0)?)?;
                if name == "rect" {
                    canvas.path.push(rect);
                } else {
                    canvas.ops.push(DrawOp::ClearRect(rect));
                }
                none()
            }
            "fill" => {
                let mut state = self.state.borrow_mut();
                let canvas = state.canvas_mut(int(args, 0)?)?;
                let rects = std::mem::take(&mut canvas.path);
                let style = canvas.fill_style.clone();
                canvas.ops.push(DrawOp::Fill { style, rects });
                none()
            }
            "offset_x" | "offset_y" | "touch_x" | "touch_y" => {
                let ev = self.state.borrow().event(int(args, 0)?)?;
                if name.starts_with("touch") && !ev.touch {
                    bail!("{name} read from a mouse event");
                }
                handle(if name.ends_with('x') { ev.x } else { ev.y })
            }
            "make_callback" => {
                let module = call
                    .caller_module()
                    .context("callbacks can only be made by a binary module")?
                    .to_owned();
                let export = call.read_str(int(args, 0)?, int(args, 1)?)?;
                handle(self.alloc(HostObject::Callback(Callback { module, export })))
            }
            "set_event_handler" => {
                let event = call.read_str(int(args, 1)?, int(args, 2)?)?;
                let mut state = self.state.borrow_mut();
                let callback = callback_of(&state, int(args, 3)?)?;
                state.element_mut(int(args, 0)?)?.handlers.insert(event, callback);
                none()
            }
            "set_interval" => {
                let period_ms = u64::try_from(int(args, 1)?).context("negative interval")?.max(1);
                let mut state = self.state.borrow_mut();
                let callback = callback_of(&state, int(args, 0)?)?;
                let id = state.next_interval;
                state.next_interval += 1;
                let next_due = state.now_ms + period_ms;
                state.intervals.push(Interval {
                    id,
                    callback,
                    period_ms,
                    next_due,
                });
                handle(id)
            }
            "clear_interval" => {
                let id = int(args, 0)?;
                self.state.borrow_mut().intervals.retain(|interval| interval.id != id);
                none()
            }
            "random" => Ok(vec![Value::F64(random_f64()?)]),
            "new_no_args" => {
                let body = call.read_str(int(args, 0)?, int(args, 1)?)?;
                handle(self.alloc(HostObject::Function { body }))
            }
            "call" => {
                let object = self.state.borrow().slot(int(args, 0)?)?;
                match &*object {
                    HostObject::Function { body } if body.trim() == "return this" => {
                        handle(self.alloc(HostObject::Window))
                    }
                    HostObject::Function { .. } => handle(UNDEFINED),
                    other => bail!("{other:?} is not a function"),
                }
            }
            other => bail!("unknown host function {other:?}"),
        }
    }

    fn alloc(&self, object: HostObject) -> i32 {
        self.state.borrow_mut().alloc(Rc::new(object))
    }

    fn fire(&self, callback: &Callback, args: &[Value]) -> Result<()> {
        let registry = self
            .registry
            .borrow()
            .as_ref()
            .and_then(WeakRegistry::upgrade)
            .context("host surface is not installed")?;
        let table = registry
            .binary_exports(&callback.module)
            .with_context(|| format!("binary module {:?} is not linked", callback.module))?;
        table
            .call(&callback.export, args)
            .with_context(|| format!("callback {}::{}", callback.module, callback.export))?;
        Ok(())
    }

    /// Delivers a pointer event to the handler `event` (e.g. `"mousedown"`) of the element with
    /// DOM id `element_id`. Returns whether a handler ran.
    pub fn dispatch(&self, element_id: &str, event: &str, pointer: PointerEvent) -> Result<bool> {
        let callback = {
            let state = self.state.borrow();
            let idx = state
                .find_by_id(element_id)
                .with_context(|| format!("no element with id {element_id:?}"))?;
            state.elements[idx].handlers.get(event).cloned()
        };
        let Some(callback) = callback else {
            return Ok(false);
        };
        let handle = self.alloc(HostObject::Event(pointer));
        let fired = self.fire(&callback, &[Value::I32(handle)]);
        self.state.borrow_mut().release(handle)?;
        fired.map(|()| true)
    }

    /// Moves the clock forward by `ms`, firing due intervals in deadline order. Returns how many
    /// callbacks ran. A failing callback stops the run; the clock still ends at the target and the
    /// failed interval stays scheduled for its next period.
    pub fn advance(&self, ms: u64) -> Result<usize> {
        let target = self.state.borrow().now_ms + ms;
        let mut fired = 0;
        loop {
            let due = {
                let mut state = self.state.borrow_mut();
                let next = state
                    .intervals
                    .iter_mut()
                    .filter(|interval| interval.next_due <= target)
                    .min_by_key(|interval| (interval.next_due, interval.id));
                match next {
                    Some(interval) => {
                        let at = interval.next_due;
                        interval.next_due += interval.period_ms;
                        let callback = interval.callback.clone();
                        state.now_ms = at;
                        Some(callback)
                    }
                    None => None,
                }
            };
            let Some(callback) = due else {
                break;
            };
            if let Err(err) = self.fire(&callback, &[]) {
                self.state.borrow_mut().now_ms = target;
                return Err(err);
            }
            fired += 1;
        }
        self.state.borrow_mut().now_ms = target;
        Ok(fired)
    }

    pub fn now_ms(&self) -> u64 {
        self.state.borrow().now_ms
    }

    pub fn interval_count(&self) -> usize {
        self.state.borrow().intervals.len()
    }

    pub fn console(&self) -> Vec<String> {
        self.state.borrow().console.clone()
    }

    pub fn live_objects(&self) -> usize {
        self.state.borrow().heap.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn object(&self, handle: i32) -> Result<HostObject> {
        Ok(self.state.borrow().slot(handle)?.as_ref().clone())
    }

    pub fn element_by_id(&self, id: &str) -> Option<Element> {
        let state = self.state.borrow();
        state.find_by_id(id).map(|idx| state.elements[idx].clone())
    }

    /// Draw operations recorded on the canvas with DOM id `id`.
    pub fn draw_ops(&self, id: &str) -> Vec<DrawOp> {
        self.element_by_id(id)
            .and_then(|el| el.canvas)
            .map(|canvas| canvas.ops)
            .unwrap_or_default()
    }
}

impl fmt::Debug for HostSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("HostSurface")
            .field("elements", &state.elements.len())
            .field("live_objects", &state.heap.iter().filter(|s| s.is_some()).count())
            .field("intervals", &state.intervals.len())
            .field("now_ms", &state.now_ms)
            .finish()
    }
}

fn callback_of(state: &State, handle: i32) -> Result<Callback> {
    match &*state.slot(handle)? {
        HostObject::Callback(cb) => Ok(cb.clone()),
        other => bail!("handle {handle} is {other:?}, not a callback"),
    }
}

fn int(args: &[Value], idx: usize) -> Result<i32> {
    args.get(idx)
        .with_context(|| format!("missing argument {idx}"))?
        .as_i32()
        .with_context(|| format!("argument {idx}"))
}

fn float(args: &[Value], idx: usize) -> Result<f64> {
    args.get(idx)
        .with_context(|| format!("missing argument {idx}"))?
        .as_f64()
        .with_context(|| format!("argument {idx}"))
}

fn random_f64() -> Result<f64> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).map_err(|err| anyhow::anyhow!("getrandom: {err}"))?;
    Ok((u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64)
}
