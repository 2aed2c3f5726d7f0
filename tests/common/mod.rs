//! Test harness: assemble real class files in memory and boot a VM with a
//! synthetic core library, so end-to-end tests need no JDK on disk.

use byteorder::{BigEndian, WriteBytesExt};
use hashbrown::HashMap;

use excelsa::jvm::link::define_bootstrap_class;
use excelsa::jvm::{HostIo, JavaEnv, VmOptions};

/// Constant pool under construction, with interning per entry kind.
#[derive(Default)]
pub struct PoolBuilder {
    entries: Vec<Vec<u8>>,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
    strings: HashMap<String, u16>,
    name_and_types: HashMap<(u16, u16), u16>,
    field_refs: HashMap<(u16, u16), u16>,
    method_refs: HashMap<(u16, u16, bool), u16>,
}

impl PoolBuilder {
    fn push(&mut self, bytes: Vec<u8>) -> u16 {
        self.entries.push(bytes);
        self.entries.len() as u16
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        if let Some(index) = self.utf8.get(text) {
            return *index;
        }
        let mut bytes = vec![1];
        bytes.write_u16::<BigEndian>(text.len() as u16).unwrap();
        bytes.extend_from_slice(text.as_bytes());
        let index = self.push(bytes);
        self.utf8.insert(text.to_string(), index);
        index
    }

    pub fn class(&mut self, name: &str) -> u16 {
        if let Some(index) = self.classes.get(name) {
            return *index;
        }
        let name_index = self.utf8(name);
        let mut bytes = vec![7];
        bytes.write_u16::<BigEndian>(name_index).unwrap();
        let index = self.push(bytes);
        self.classes.insert(name.to_string(), index);
        index
    }

    pub fn string(&mut self, text: &str) -> u16 {
        if let Some(index) = self.strings.get(text) {
            return *index;
        }
        let text_index = self.utf8(text);
        let mut bytes = vec![8];
        bytes.write_u16::<BigEndian>(text_index).unwrap();
        let index = self.push(bytes);
        self.strings.insert(text.to_string(), index);
        index
    }

    pub fn int(&mut self, value: i32) -> u16 {
        let mut bytes = vec![3];
        bytes.write_i32::<BigEndian>(value).unwrap();
        self.push(bytes)
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let key = (self.utf8(name), self.utf8(descriptor));
        if let Some(index) = self.name_and_types.get(&key) {
            return *index;
        }
        let mut bytes = vec![12];
        bytes.write_u16::<BigEndian>(key.0).unwrap();
        bytes.write_u16::<BigEndian>(key.1).unwrap();
        let index = self.push(bytes);
        self.name_and_types.insert(key, index);
        index
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let key = (self.class(class), self.name_and_type(name, descriptor));
        if let Some(index) = self.field_refs.get(&key) {
            return *index;
        }
        let mut bytes = vec![9];
        bytes.write_u16::<BigEndian>(key.0).unwrap();
        bytes.write_u16::<BigEndian>(key.1).unwrap();
        let index = self.push(bytes);
        self.field_refs.insert(key, index);
        index
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.method_ref_impl(class, name, descriptor, false)
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.method_ref_impl(class, name, descriptor, true)
    }

    fn method_ref_impl(&mut self, class: &str, name: &str, descriptor: &str, iface: bool) -> u16 {
        let key = (self.class(class), self.name_and_type(name, descriptor), iface);
        if let Some(index) = self.method_refs.get(&key) {
            return *index;
        }
        let mut bytes = vec![if iface { 11 } else { 10 }];
        bytes.write_u16::<BigEndian>(key.0).unwrap();
        bytes.write_u16::<BigEndian>(key.1).unwrap();
        let index = self.push(bytes);
        self.method_refs.insert(key, index);
        index
    }
}

pub struct CodeSpec {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    /// Raw stack map frame bytes (without the count).
    pub stack_map_frames: Vec<Vec<u8>>,
    /// (start, length, name, descriptor, slot)
    pub local_variables: Vec<(u16, u16, String, String, u16)>,
    /// (start_pc, end_pc, handler_pc, catch class name or "" for any)
    pub exception_table: Vec<(u16, u16, u16, String)>,
}

impl CodeSpec {
    pub fn new(max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        CodeSpec {
            max_stack,
            max_locals,
            code,
            stack_map_frames: Vec::new(),
            local_variables: Vec::new(),
            exception_table: Vec::new(),
        }
    }
}

pub struct MethodSpec {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub code: Option<CodeSpec>,
}

pub struct ClassBuilder {
    pub name: String,
    pub super_name: Option<String>,
    pub access: u16,
    pub interfaces: Vec<String>,
    /// (access, name, descriptor)
    pub fields: Vec<(u16, String, String)>,
    pub methods: Vec<MethodSpec>,
    pub pool: PoolBuilder,
}

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

impl ClassBuilder {
    pub fn new(name: &str, super_name: Option<&str>) -> Self {
        ClassBuilder {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            access: ACC_PUBLIC | ACC_SUPER,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            pool: PoolBuilder::default(),
        }
    }

    pub fn interface(name: &str) -> Self {
        let mut builder = ClassBuilder::new(name, Some("java/lang/Object"));
        builder.access = ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT;
        builder
    }

    pub fn field(&mut self, access: u16, name: &str, descriptor: &str) -> &mut Self {
        self.fields.push((access, name.to_string(), descriptor.to_string()));
        self
    }

    pub fn method(&mut self, access: u16, name: &str, descriptor: &str, code: CodeSpec) -> &mut Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: Some(code),
        });
        self
    }

    pub fn abstract_method(&mut self, access: u16, name: &str, descriptor: &str) -> &mut Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: None,
        });
        self
    }

    /// A constructor that just calls the superclass constructor.
    pub fn trivial_ctor(&mut self) -> &mut Self {
        let super_name = self.super_name.clone().unwrap_or_else(|| "java/lang/Object".into());
        let init = self.pool.method_ref(&super_name, "<init>", "()V");
        let code = vec![0x2a, 0xb7, (init >> 8) as u8, init as u8, 0xb1];
        self.method(ACC_PUBLIC, "<init>", "()V", CodeSpec::new(1, 1, code));
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        let this_class = self.pool.class(&self.name);
        let super_class = match &self.super_name {
            Some(name) => self.pool.class(name),
            None => 0,
        };
        let interface_indices: Vec<u16> = {
            let names = self.interfaces.clone();
            names.iter().map(|name| self.pool.class(name)).collect()
        };

        // Reserve all pool text before serializing anything
        let field_texts: Vec<(String, String)> = self
            .fields
            .iter()
            .map(|(_, name, descriptor)| (name.clone(), descriptor.clone()))
            .collect();
        let field_indices: Vec<(u16, u16)> = field_texts
            .iter()
            .map(|(name, descriptor)| (self.pool.utf8(name), self.pool.utf8(descriptor)))
            .collect();

        struct MethodBytes {
            access: u16,
            name_index: u16,
            descriptor_index: u16,
            code: Option<Vec<u8>>,
        }

        let mut method_bytes = Vec::new();
        let code_attr_name = self.pool.utf8("Code");
        let stack_map_name = self.pool.utf8("StackMapTable");
        let lvt_name = self.pool.utf8("LocalVariableTable");

        let methods = std::mem::take(&mut self.methods);
        for method in methods {
            let name_index = self.pool.utf8(&method.name);
            let descriptor_index = self.pool.utf8(&method.descriptor);

            let code = method.code.as_ref().map(|spec| {
                let mut attrs: Vec<(u16, Vec<u8>)> = Vec::new();

                if !spec.stack_map_frames.is_empty() {
                    let mut body = Vec::new();
                    body.write_u16::<BigEndian>(spec.stack_map_frames.len() as u16).unwrap();
                    for frame in &spec.stack_map_frames {
                        body.extend_from_slice(frame);
                    }
                    attrs.push((stack_map_name, body));
                }

                if !spec.local_variables.is_empty() {
                    let mut body = Vec::new();
                    body.write_u16::<BigEndian>(spec.local_variables.len() as u16).unwrap();
                    for (start, length, name, descriptor, slot) in &spec.local_variables {
                        let name_index = self.pool.utf8(name);
                        let descriptor_index = self.pool.utf8(descriptor);
                        body.write_u16::<BigEndian>(*start).unwrap();
                        body.write_u16::<BigEndian>(*length).unwrap();
                        body.write_u16::<BigEndian>(name_index).unwrap();
                        body.write_u16::<BigEndian>(descriptor_index).unwrap();
                        body.write_u16::<BigEndian>(*slot).unwrap();
                    }
                    attrs.push((lvt_name, body));
                }

                let exception_table: Vec<(u16, u16, u16, u16)> = spec
                    .exception_table
                    .iter()
                    .map(|(start, end, handler, catch)| {
                        let catch_index =
                            if catch.is_empty() { 0 } else { self.pool.class(catch) };
                        (*start, *end, *handler, catch_index)
                    })
                    .collect();

                let mut body = Vec::new();
                body.write_u16::<BigEndian>(spec.max_stack).unwrap();
                body.write_u16::<BigEndian>(spec.max_locals).unwrap();
                body.write_u32::<BigEndian>(spec.code.len() as u32).unwrap();
                body.extend_from_slice(&spec.code);
                body.write_u16::<BigEndian>(exception_table.len() as u16).unwrap();
                for (start, end, handler, catch) in exception_table {
                    body.write_u16::<BigEndian>(start).unwrap();
                    body.write_u16::<BigEndian>(end).unwrap();
                    body.write_u16::<BigEndian>(handler).unwrap();
                    body.write_u16::<BigEndian>(catch).unwrap();
                }
                body.write_u16::<BigEndian>(attrs.len() as u16).unwrap();
                for (attr_name, attr_body) in attrs {
                    body.write_u16::<BigEndian>(attr_name).unwrap();
                    body.write_u32::<BigEndian>(attr_body.len() as u32).unwrap();
                    body.extend_from_slice(&attr_body);
                }
                body
            });

            method_bytes.push(MethodBytes {
                access: method.access,
                name_index,
                descriptor_index,
                code,
            });
        }

        // Serialize
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(0xCAFE_BABE).unwrap();
        out.write_u16::<BigEndian>(0).unwrap(); // minor
        out.write_u16::<BigEndian>(52).unwrap(); // major (Java 8)

        out.write_u16::<BigEndian>(self.pool.entries.len() as u16 + 1).unwrap();
        for entry in &self.pool.entries {
            out.extend_from_slice(entry);
        }

        out.write_u16::<BigEndian>(self.access).unwrap();
        out.write_u16::<BigEndian>(this_class).unwrap();
        out.write_u16::<BigEndian>(super_class).unwrap();

        out.write_u16::<BigEndian>(interface_indices.len() as u16).unwrap();
        for index in interface_indices {
            out.write_u16::<BigEndian>(index).unwrap();
        }

        out.write_u16::<BigEndian>(self.fields.len() as u16).unwrap();
        for ((access, _, _), (name_index, descriptor_index)) in
            self.fields.iter().zip(field_indices)
        {
            out.write_u16::<BigEndian>(*access).unwrap();
            out.write_u16::<BigEndian>(name_index).unwrap();
            out.write_u16::<BigEndian>(descriptor_index).unwrap();
            out.write_u16::<BigEndian>(0).unwrap(); // attributes
        }

        out.write_u16::<BigEndian>(method_bytes.len() as u16).unwrap();
        for method in method_bytes {
            out.write_u16::<BigEndian>(method.access).unwrap();
            out.write_u16::<BigEndian>(method.name_index).unwrap();
            out.write_u16::<BigEndian>(method.descriptor_index).unwrap();
            match method.code {
                Some(code) => {
                    out.write_u16::<BigEndian>(1).unwrap();
                    out.write_u16::<BigEndian>(code_attr_name).unwrap();
                    out.write_u32::<BigEndian>(code.len() as u32).unwrap();
                    out.extend_from_slice(&code);
                }
                None => out.write_u16::<BigEndian>(0).unwrap(),
            }
        }

        out.write_u16::<BigEndian>(0).unwrap(); // class attributes
        out
    }
}

/// Stdout/stderr capture for end-to-end assertions.
#[derive(Default)]
pub struct CaptureIo {
    pub stdout: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    pub stderr: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

impl HostIo for CaptureIo {
    fn write_stdout(&mut self, bytes: &[u8]) {
        self.stdout.lock().unwrap().extend_from_slice(bytes);
    }

    fn write_stderr(&mut self, bytes: &[u8]) {
        self.stderr.lock().unwrap().extend_from_slice(bytes);
    }
}

fn empty_classpath_dir() -> String {
    let dir = std::env::temp_dir().join("excelsa-vm-tests-classpath");
    let _ = std::fs::create_dir_all(&dir);
    dir.to_string_lossy().to_string()
}

pub fn boot_env() -> (JavaEnv, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
    let capture = CaptureIo::default();
    let stdout = capture.stdout.clone();
    let mut env = JavaEnv::with_io(
        VmOptions {
            classpath: empty_classpath_dir(),
            heap_bytes: 1 << 22,
            preemption_us: 2_000,
        },
        Box::new(capture),
    )
    .unwrap();

    define_core_classes(&mut env);
    (env, stdout)
}

/// Define the minimal core library every test relies on: Object, String,
/// Class, Throwable and the exception hierarchy the VM raises.
pub fn define_core_classes(env: &mut JavaEnv) {
    let tid = env.main_thread();

    let mut object = ClassBuilder::new("java/lang/Object", None);
    object.method(ACC_PUBLIC, "<init>", "()V", CodeSpec::new(0, 1, vec![0xb1]));
    object.abstract_method(ACC_PUBLIC | ACC_NATIVE, "hashCode", "()I");
    define_bootstrap_class(env, tid, "java/lang/Object", &object.build()).unwrap();

    // Marker interfaces every array class resolves during synthesis
    let cloneable = ClassBuilder::interface("java/lang/Cloneable");
    define_bootstrap_class(env, tid, "java/lang/Cloneable", &cloneable.build()).unwrap();
    let serializable = ClassBuilder::interface("java/io/Serializable");
    define_bootstrap_class(env, tid, "java/io/Serializable", &serializable.build()).unwrap();

    let mut string = ClassBuilder::new("java/lang/String", Some("java/lang/Object"));
    string.field(0, "value", "[C").field(0, "hash", "I");
    string.trivial_ctor();
    define_bootstrap_class(env, tid, "java/lang/String", &string.build()).unwrap();

    let mut class_class = ClassBuilder::new("java/lang/Class", Some("java/lang/Object"));
    class_class.field(0, "name", "Ljava/lang/String;");
    class_class.trivial_ctor();
    define_bootstrap_class(env, tid, "java/lang/Class", &class_class.build()).unwrap();

    let mut throwable = ClassBuilder::new("java/lang/Throwable", Some("java/lang/Object"));
    throwable.field(0, "detailMessage", "Ljava/lang/String;");
    throwable.trivial_ctor();
    define_bootstrap_class(env, tid, "java/lang/Throwable", &throwable.build()).unwrap();

    let hierarchy = [
        ("java/lang/Exception", "java/lang/Throwable"),
        ("java/lang/Error", "java/lang/Throwable"),
        ("java/lang/RuntimeException", "java/lang/Exception"),
        ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
        ("java/lang/NullPointerException", "java/lang/RuntimeException"),
        ("java/lang/ArrayIndexOutOfBoundsException", "java/lang/RuntimeException"),
        ("java/lang/NegativeArraySizeException", "java/lang/RuntimeException"),
        ("java/lang/ArrayStoreException", "java/lang/RuntimeException"),
        ("java/lang/ClassCastException", "java/lang/RuntimeException"),
        ("java/lang/IllegalMonitorStateException", "java/lang/RuntimeException"),
        ("java/lang/IllegalStateException", "java/lang/RuntimeException"),
        ("java/lang/InterruptedException", "java/lang/Exception"),
        ("java/lang/ClassNotFoundException", "java/lang/Exception"),
        ("java/lang/IncompatibleClassChangeError", "java/lang/Error"),
        ("java/lang/AbstractMethodError", "java/lang/IncompatibleClassChangeError"),
        ("java/lang/UnsatisfiedLinkError", "java/lang/IncompatibleClassChangeError"),
        ("java/lang/NoClassDefFoundError", "java/lang/Error"),
        ("java/lang/ClassFormatError", "java/lang/Error"),
        ("java/lang/ClassCircularityError", "java/lang/Error"),
        ("java/lang/StackOverflowError", "java/lang/Error"),
        ("java/lang/OutOfMemoryError", "java/lang/Error"),
        ("java/lang/ExceptionInInitializerError", "java/lang/Error"),
    ];

    for (name, super_name) in hierarchy {
        let mut builder = ClassBuilder::new(name, Some(super_name));
        builder.trivial_ctor();
        define_bootstrap_class(env, tid, name, &builder.build()).unwrap();
    }

    let mut thread = ClassBuilder::new("java/lang/Thread", Some("java/lang/Object"));
    thread
        .field(0, "eetop", "J")
        .field(0, "priority", "I")
        .field(0, "daemon", "Z");
    thread.trivial_ctor();
    thread.abstract_method(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, "yield", "()V");
    thread.abstract_method(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, "sleep", "(J)V");
    thread.method(ACC_PUBLIC, "run", "()V", CodeSpec::new(0, 1, vec![0xb1]));
    define_bootstrap_class(env, tid, "java/lang/Thread", &thread.build()).unwrap();
}

/// Drive the scheduler until it reports done.
pub fn run_to_completion(env: &mut JavaEnv) {
    use excelsa::jvm::scheduler::SchedulerResult;
    for _ in 0..100_000 {
        match env.step() {
            SchedulerResult::Done => return,
            SchedulerResult::More => continue,
            SchedulerResult::Inval => panic!("scheduler entered an illegal state"),
        }
    }
    panic!("scheduler did not finish");
}
