//! Binding to a vendor PKCS#11 module loaded at runtime.

use std::{
    fmt, mem,
    path::{Path, PathBuf},
    ptr,
    sync::Arc,
};

use cryptoki::error::RvError;
use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_C_INITIALIZE_ARGS, CK_FLAGS, CK_FUNCTION_LIST,
    CK_FUNCTION_LIST_PTR, CK_FUNCTION_LIST_PTR_PTR, CK_INVALID_HANDLE, CK_MECHANISM, CK_MECHANISM_TYPE,
    CK_OBJECT_CLASS, CK_RV, CK_TOKEN_INFO, CK_ULONG, CK_USER_TYPE, CKA_CLASS, CKF_OS_LOCKING_OK,
};
use libloading::{Library, Symbol};
use log::{debug, info, trace, warn};

use super::{
    api::{ObjectHandle, Pkcs11Api, SessionHandle, SlotId, TokenInfo, check},
    error::DriverError,
};

type GetFunctionList = unsafe extern "C" fn(CK_FUNCTION_LIST_PTR_PTR) -> CK_RV;

/// Calls an entry of the function table, failing with `CKR_FUNCTION_NOT_SUPPORTED` if the module left it empty.
macro_rules! call {
    ($module:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        let function = unsafe { (*$module.functions).$function }.ok_or(RvError::FunctionNotSupported)?;
        check(unsafe { function($($arg),*) })
    }};
}

//------------ Pkcs11Module --------------------------------------------------

/// A loaded and initialized PKCS#11 module.
///
/// The module is finalized by [`DriverBinder::unload`], not on drop, so that a module can never be finalized while a
/// worker still holds a reference to it.
pub struct Pkcs11Module {
    path: PathBuf,

    functions: CK_FUNCTION_LIST_PTR,

    // Must outlive `functions`, which points into the library's memory.
    _library: Library,
}

// The function table is immutable once returned by C_GetFunctionList and the module is initialized with
// CKF_OS_LOCKING_OK.
unsafe impl Send for Pkcs11Module {}
unsafe impl Sync for Pkcs11Module {}

impl fmt::Debug for Pkcs11Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Module").field("path", &self.path).finish()
    }
}

impl Pkcs11Module {
    /// Loads the module at `path`, resolves its function table and calls `C_Initialize`.
    pub fn load(path: &Path) -> Result<Self, DriverError> {
        debug!("PKCS#11: Loading module '{}'", path.display());
        let library = unsafe { Library::new(path) }.map_err(DriverError::Load)?;

        let functions = {
            let get_function_list: Symbol<GetFunctionList> =
                unsafe { library.get(b"C_GetFunctionList\0") }.map_err(DriverError::MissingEntryPoint)?;
            let mut functions: CK_FUNCTION_LIST_PTR = ptr::null_mut();
            check(unsafe { get_function_list(&mut functions) }).map_err(DriverError::FunctionList)?;
            functions
        };
        if functions.is_null() {
            return Err(DriverError::FunctionList(RvError::GeneralError));
        }

        let module = Pkcs11Module {
            path: path.to_path_buf(),
            functions,
            _library: library,
        };
        module.initialize()?;
        Ok(module)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn initialize(&self) -> Result<(), DriverError> {
        let mut args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        self.c_initialize(&mut args).map_err(DriverError::Initialize)
    }

    fn c_initialize(&self, args: &mut CK_C_INITIALIZE_ARGS) -> Result<(), RvError> {
        call!(self, C_Initialize, (args as *mut CK_C_INITIALIZE_ARGS).cast())
    }

    fn table(&self) -> &CK_FUNCTION_LIST {
        unsafe { &*self.functions }
    }
}

/// Splits an optional output buffer into the pointer/length pair expected by the module.
fn output(buf: Option<&mut [u8]>) -> (*mut u8, CK_ULONG) {
    match buf {
        Some(buf) => (buf.as_mut_ptr(), buf.len() as CK_ULONG),
        None => (ptr::null_mut(), 0),
    }
}

fn mechanism(mechanism: CK_MECHANISM_TYPE) -> CK_MECHANISM {
    CK_MECHANISM {
        mechanism,
        pParameter: ptr::null_mut(),
        ulParameterLen: 0,
    }
}

impl Pkcs11Api for Pkcs11Module {
    fn get_slot_list(&self, token_present: bool) -> Result<Vec<SlotId>, RvError> {
        let present = CK_BBOOL::from(token_present);
        let mut count: CK_ULONG = 0;
        call!(self, C_GetSlotList, present, ptr::null_mut(), &mut count)?;

        let mut slots: Vec<SlotId> = vec![0; count as usize];
        call!(self, C_GetSlotList, present, slots.as_mut_ptr(), &mut count)?;
        slots.truncate(count as usize);
        trace!("PKCS#11: C_GetSlotList(): {:?}", slots);
        Ok(slots)
    }

    fn get_token_info(&self, slot: SlotId) -> Result<TokenInfo, RvError> {
        let mut info: CK_TOKEN_INFO = unsafe { mem::zeroed() };
        call!(self, C_GetTokenInfo, slot, &mut info)?;
        Ok(TokenInfo::from(&info))
    }

    fn open_session(&self, slot: SlotId, flags: CK_FLAGS) -> Result<SessionHandle, RvError> {
        let mut handle: SessionHandle = CK_INVALID_HANDLE;
        call!(self, C_OpenSession, slot, flags, ptr::null_mut(), None, &mut handle)?;
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), RvError> {
        call!(self, C_CloseSession, session)
    }

    fn find_objects_init(&self, session: SessionHandle, class: CK_OBJECT_CLASS) -> Result<(), RvError> {
        let mut class = class;
        let mut template = CK_ATTRIBUTE {
            type_: CKA_CLASS,
            pValue: (&mut class as *mut CK_OBJECT_CLASS).cast(),
            ulValueLen: mem::size_of::<CK_OBJECT_CLASS>() as CK_ULONG,
        };
        call!(self, C_FindObjectsInit, session, &mut template, 1)
    }

    fn find_objects(&self, session: SessionHandle, max_count: usize) -> Result<Vec<ObjectHandle>, RvError> {
        let mut objects: Vec<ObjectHandle> = vec![CK_INVALID_HANDLE; max_count];
        let mut count: CK_ULONG = 0;
        call!(
            self,
            C_FindObjects,
            session,
            objects.as_mut_ptr(),
            max_count as CK_ULONG,
            &mut count
        )?;
        objects.truncate(count as usize);
        Ok(objects)
    }

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), RvError> {
        call!(self, C_FindObjectsFinal, session)
    }

    fn get_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: CK_ATTRIBUTE_TYPE,
        value: Option<&mut [u8]>,
    ) -> Result<usize, RvError> {
        let (value, len) = output(value);
        let mut template = CK_ATTRIBUTE {
            type_: attribute,
            pValue: value.cast(),
            ulValueLen: len,
        };
        call!(self, C_GetAttributeValue, session, object, &mut template, 1)?;
        Ok(template.ulValueLen as usize)
    }

    fn login(&self, session: SessionHandle, user_type: CK_USER_TYPE, pin: Option<&[u8]>) -> Result<(), RvError> {
        let (pin, len) = match pin {
            Some(pin) => (pin.as_ptr() as *mut u8, pin.len() as CK_ULONG),
            None => (ptr::null_mut(), 0),
        };
        call!(self, C_Login, session, user_type, pin, len)
    }

    fn logout(&self, session: SessionHandle) -> Result<(), RvError> {
        call!(self, C_Logout, session)
    }

    fn sign_init(
        &self,
        session: SessionHandle,
        mechanism_type: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> Result<(), RvError> {
        let mut mechanism = mechanism(mechanism_type);
        call!(self, C_SignInit, session, &mut mechanism, key)
    }

    fn sign(&self, session: SessionHandle, data: &[u8], signature: Option<&mut [u8]>) -> Result<usize, RvError> {
        let (signature, mut len) = output(signature);
        call!(
            self,
            C_Sign,
            session,
            data.as_ptr() as *mut u8,
            data.len() as CK_ULONG,
            signature,
            &mut len
        )?;
        Ok(len as usize)
    }

    fn verify_init(
        &self,
        session: SessionHandle,
        mechanism_type: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> Result<(), RvError> {
        let mut mechanism = mechanism(mechanism_type);
        call!(self, C_VerifyInit, session, &mut mechanism, key)
    }

    fn verify(&self, session: SessionHandle, data: &[u8], signature: &[u8]) -> Result<(), RvError> {
        call!(
            self,
            C_Verify,
            session,
            data.as_ptr() as *mut u8,
            data.len() as CK_ULONG,
            signature.as_ptr() as *mut u8,
            signature.len() as CK_ULONG
        )
    }

    fn encrypt_init(
        &self,
        session: SessionHandle,
        mechanism_type: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> Result<(), RvError> {
        let mut mechanism = mechanism(mechanism_type);
        call!(self, C_EncryptInit, session, &mut mechanism, key)
    }

    fn encrypt(&self, session: SessionHandle, data: &[u8], encrypted: Option<&mut [u8]>) -> Result<usize, RvError> {
        let (encrypted, mut len) = output(encrypted);
        call!(
            self,
            C_Encrypt,
            session,
            data.as_ptr() as *mut u8,
            data.len() as CK_ULONG,
            encrypted,
            &mut len
        )?;
        Ok(len as usize)
    }

    fn decrypt_init(
        &self,
        session: SessionHandle,
        mechanism_type: CK_MECHANISM_TYPE,
        key: ObjectHandle,
    ) -> Result<(), RvError> {
        let mut mechanism = mechanism(mechanism_type);
        call!(self, C_DecryptInit, session, &mut mechanism, key)
    }

    fn decrypt(&self, session: SessionHandle, encrypted: &[u8], data: Option<&mut [u8]>) -> Result<usize, RvError> {
        let (data, mut len) = output(data);
        call!(
            self,
            C_Decrypt,
            session,
            encrypted.as_ptr() as *mut u8,
            encrypted.len() as CK_ULONG,
            data,
            &mut len
        )?;
        Ok(len as usize)
    }

    fn finalize(&self) -> Result<(), RvError> {
        let version = self.table().version;
        trace!(
            "PKCS#11: Finalizing module '{}' (Cryptoki v{}.{})",
            self.path.display(),
            version.major,
            version.minor
        );
        call!(self, C_Finalize, ptr::null_mut())
    }
}

//------------ DriverBinder --------------------------------------------------

/// Owns the function table of at most one PKCS#11 module.
#[derive(Default)]
pub struct DriverBinder {
    api: Option<Arc<dyn Pkcs11Api>>,
}

impl fmt::Debug for DriverBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverBinder")
            .field("loaded", &self.api.is_some())
            .finish()
    }
}

impl DriverBinder {
    pub fn load(&mut self, path: &Path) -> Result<(), DriverError> {
        if self.api.is_some() {
            return Err(DriverError::AlreadyLoaded);
        }
        let module = Pkcs11Module::load(path)?;
        info!("PKCS#11: Loaded module '{}'", module.path().display());
        self.api = Some(Arc::new(module));
        Ok(())
    }

    /// Binds an already initialized module, e.g. one shared with another component of the host application.
    pub fn bind(&mut self, api: Arc<dyn Pkcs11Api>) -> Result<(), DriverError> {
        if self.api.is_some() {
            return Err(DriverError::AlreadyLoaded);
        }
        self.api = Some(api);
        Ok(())
    }

    pub fn api(&self) -> Option<&Arc<dyn Pkcs11Api>> {
        self.api.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.api.is_some()
    }

    /// Finalizes and releases the module. Does nothing if no module is bound.
    pub fn unload(&mut self) {
        if let Some(api) = self.api.take() {
            if let Err(err) = api.finalize() {
                warn!("PKCS#11: Failed to finalize module: {}", err);
            }
            info!("PKCS#11: Module unloaded");
        }
    }
}

//------------ Tests ---------------------------------------------------------
