use crate::jvm::class::ClassId;
use crate::jvm::link::bootstrap_lookup_class;
use crate::jvm::mem::{FieldDescriptor, JavaValue, ObjRef, TypeKind};
use crate::jvm::{JavaEnv, VmResult};

/// String construction and interning. Works against either field layout of
/// java/lang/String: the compact `value: [B` + `coder: B` form or the older
/// `value: [C` form, chosen by whatever String class the classpath supplies.
impl JavaEnv {
    pub fn string_class(&mut self, tid: u32) -> VmResult<ClassId> {
        if let Some(class) = self.well_known.string.get() {
            return Ok(class);
        }
        let class = bootstrap_lookup_class(self, tid, "java/lang/String")?;
        self.well_known.string.set(Some(class));
        Ok(class)
    }

    /// Build a fresh (uninterned) java.lang.String.
    pub fn make_string(&mut self, tid: u32, text: &str) -> VmResult<ObjRef> {
        let string_class = self.string_class(tid)?;

        let (value_owner, value_index) = self
            .field_lookup(string_class, "value")
            .expect("String class without a value field");
        let compact = matches!(
            &self.class(value_owner).field(value_index).descriptor,
            FieldDescriptor::Array(element) if **element == FieldDescriptor::Byte
        );
        let value_offset = self.class(value_owner).field(value_index).byte_offset.get();

        let units: Vec<u16> = text.encode_utf16().collect();

        let (array, coder) = if compact {
            let latin1 = units.iter().all(|x| *x < 256);
            let array_class = bootstrap_lookup_class(self, tid, "[B")?;
            if latin1 {
                let array = self.new_array(tid, array_class, units.len() as i32)?;
                for (i, unit) in units.iter().enumerate() {
                    self.heap.set_element(array, TypeKind::Byte, i, JavaValue::Byte(*unit as i8));
                }
                (array, 0i8)
            } else {
                let array = self.new_array(tid, array_class, units.len() as i32 * 2)?;
                for (i, unit) in units.iter().enumerate() {
                    let [low, high] = unit.to_le_bytes();
                    self.heap
                        .set_element(array, TypeKind::Byte, i * 2, JavaValue::Byte(low as i8));
                    self.heap
                        .set_element(array, TypeKind::Byte, i * 2 + 1, JavaValue::Byte(high as i8));
                }
                (array, 1i8)
            }
        } else {
            let array_class = bootstrap_lookup_class(self, tid, "[C")?;
            let array = self.new_array(tid, array_class, units.len() as i32)?;
            for (i, unit) in units.iter().enumerate() {
                self.heap.set_element(array, TypeKind::Char, i, JavaValue::Char(*unit));
            }
            (array, 0i8)
        };

        // Hold the array across the String allocation
        let handle = self.threads[tid as usize].handles.make(Some(array));
        let result = self.new_object(tid, string_class);
        let array = self.threads[tid as usize].handles.get(handle).unwrap();
        self.threads[tid as usize].handles.drop_handle(handle);
        let string = result?;

        self.heap
            .set_field(string, value_offset as usize, JavaValue::Reference(Some(array)));

        if compact {
            if let Some((owner, index)) = self.field_lookup(string_class, "coder") {
                let offset = self.class(owner).field(index).byte_offset.get();
                self.heap.set_field(string, offset as usize, JavaValue::Byte(coder));
            }
        }

        if let Some((owner, index)) = self.field_lookup(string_class, "hash") {
            let offset = self.class(owner).field(index).byte_offset.get();
            self.heap.set_field(string, offset as usize, JavaValue::Int(0));
        }

        Ok(string)
    }

    /// The canonical String for this text, consulting and populating the
    /// intern table.
    pub fn intern_string(&mut self, tid: u32, text: &str) -> VmResult<ObjRef> {
        if let Some(existing) = self.interned_strings.get(text) {
            return Ok(*existing);
        }

        let string = self.make_string(tid, text)?;
        self.interned_strings.insert(text.to_string(), string);
        Ok(string)
    }

    /// Intern an existing String object by content.
    pub fn intern_string_object(&mut self, obj: ObjRef) -> ObjRef {
        let text = match self.read_string(obj) {
            Some(text) => text,
            None => return obj,
        };

        match self.interned_strings.get(&text) {
            Some(existing) => *existing,
            None => {
                self.interned_strings.insert(text, obj);
                obj
            }
        }
    }

    /// Decode a java.lang.String back to Rust text.
    pub fn read_string(&self, obj: ObjRef) -> Option<String> {
        let class = self.heap.class_of(obj);
        let (value_owner, value_index) = self.field_lookup(class, "value")?;
        let value_field = self.class(value_owner).field(value_index);
        let compact = matches!(
            &value_field.descriptor,
            FieldDescriptor::Array(element) if **element == FieldDescriptor::Byte
        );
        let value_offset = value_field.byte_offset.get();

        let array = match self.heap.get_field(obj, value_offset as usize, TypeKind::Reference) {
            JavaValue::Reference(Some(array)) => array,
            _ => return None,
        };
        let length = self.heap.array_length(array) as usize;

        if compact {
            let coder = match self.field_lookup(class, "coder") {
                Some((owner, index)) => {
                    let offset = self.class(owner).field(index).byte_offset.get();
                    match self.heap.get_field(obj, offset as usize, TypeKind::Byte) {
                        JavaValue::Byte(x) => x,
                        _ => 0,
                    }
                }
                None => 0,
            };

            if coder == 0 {
                let mut text = String::with_capacity(length);
                for i in 0..length {
                    match self.heap.get_element(array, TypeKind::Byte, i) {
                        JavaValue::Byte(x) => text.push(x as u8 as char),
                        _ => return None,
                    }
                }
                Some(text)
            } else {
                let mut units = Vec::with_capacity(length / 2);
                for i in 0..length / 2 {
                    let low = match self.heap.get_element(array, TypeKind::Byte, i * 2) {
                        JavaValue::Byte(x) => x as u8,
                        _ => return None,
                    };
                    let high = match self.heap.get_element(array, TypeKind::Byte, i * 2 + 1) {
                        JavaValue::Byte(x) => x as u8,
                        _ => return None,
                    };
                    units.push(u16::from_le_bytes([low, high]));
                }
                Some(String::from_utf16_lossy(&units))
            }
        } else {
            let mut units = Vec::with_capacity(length);
            for i in 0..length {
                match self.heap.get_element(array, TypeKind::Char, i) {
                    JavaValue::Char(x) => units.push(x),
                    _ => return None,
                }
            }
            Some(String::from_utf16_lossy(&units))
        }
    }
}
