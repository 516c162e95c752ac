//! Windows job object backend.
//!
//! This is the only module that touches native job-object structures; it
//! converts them to and from the `Raw*` values of [`super::encoding`].

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ABANDONED_WAIT_0, ERROR_ALREADY_EXISTS, ERROR_INVALID_HANDLE, GetLastError,
    HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, IsProcessInJob, JOB_OBJECT_ALL_ACCESS,
    JOBOBJECT_ASSOCIATE_COMPLETION_PORT, JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION,
    JOBOBJECT_BASIC_PROCESS_ID_LIST, JOBOBJECT_CPU_RATE_CONTROL_INFORMATION,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOBOBJECT_LIMIT_VIOLATION_INFORMATION, JOBOBJECTINFOCLASS,
    JobObjectAssociateCompletionPortInformation, JobObjectBasicAndIoAccountingInformation,
    JobObjectBasicProcessIdList, JobObjectCpuRateControlInformation,
    JobObjectExtendedLimitInformation, JobObjectLimitViolationInformation, OpenJobObjectW,
    QueryInformationJobObject, SetInformationJobObject, TerminateJobObject,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_QUOTA,
    PROCESS_TERMINATE,
};

use super::encoding::{
    RawAccounting, RawCpuRate, RawExtendedLimits, RawLimitViolation, RawNotification,
    RawProcessIdList,
};
use super::sys::{JobBackend, NotificationPort};
use isolite_shared::{IsolationError, IsolationResult};

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

// Kernel handles are process-wide and usable from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    fn new(handle: HANDLE, operation: &str) -> IsolationResult<Self> {
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            return Err(last_error(operation));
        }
        Ok(Self(handle))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if unsafe { CloseHandle(self.0) } == 0 {
            tracing::warn!(error = %last_error("CloseHandle"), "Failed to close handle");
        }
    }
}

fn last_error(operation: &str) -> IsolationError {
    IsolationError::from_os_code(operation, unsafe { GetLastError() })
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// A job object. `handle == None` addresses the caller's own job.
pub(crate) struct Win32Job {
    handle: Option<OwnedHandle>,
}

impl Win32Job {
    pub(crate) fn create(name: &str) -> IsolationResult<(Self, bool)> {
        let name_w = wide(name);
        let handle = unsafe { CreateJobObjectW(ptr::null(), name_w.as_ptr()) };
        let error = unsafe { GetLastError() };

        if handle.is_null() {
            if error == ERROR_INVALID_HANDLE {
                return Err(IsolationError::InvalidState(format!(
                    "an object named '{}' exists and is not a job object",
                    name
                )));
            }
            if error == ERROR_ALREADY_EXISTS {
                // Lost a creation race.
                return Ok((Self::open(name)?, false));
            }
            return Err(IsolationError::from_os_code("CreateJobObject", error));
        }

        let job = Self {
            handle: Some(OwnedHandle(handle)),
        };
        Ok((job, error != ERROR_ALREADY_EXISTS))
    }

    pub(crate) fn open(name: &str) -> IsolationResult<Self> {
        let name_w = wide(name);
        let handle = unsafe { OpenJobObjectW(JOB_OBJECT_ALL_ACCESS, 0, name_w.as_ptr()) };
        Ok(Self {
            handle: Some(OwnedHandle::new(handle, "OpenJobObject")?),
        })
    }

    pub(crate) fn current() -> IsolationResult<Option<Self>> {
        let mut in_job = 0;
        if unsafe { IsProcessInJob(GetCurrentProcess(), ptr::null_mut(), &mut in_job) } == 0 {
            return Err(last_error("IsProcessInJob"));
        }
        Ok((in_job != 0).then_some(Self { handle: None }))
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_ref().map_or(ptr::null_mut(), |h| h.0)
    }

    fn query<T>(&self, class: JOBOBJECTINFOCLASS, operation: &str) -> IsolationResult<T> {
        // Every T used here is a plain C struct for which all-zero is valid.
        let mut info: T = unsafe { mem::zeroed() };
        let ok = unsafe {
            QueryInformationJobObject(
                self.raw(),
                class,
                &mut info as *mut T as *mut c_void,
                mem::size_of::<T>() as u32,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_error(operation));
        }
        Ok(info)
    }

    fn set<T>(&self, class: JOBOBJECTINFOCLASS, info: &T, operation: &str) -> IsolationResult<()> {
        let ok = unsafe {
            SetInformationJobObject(
                self.raw(),
                class,
                info as *const T as *const c_void,
                mem::size_of::<T>() as u32,
            )
        };
        if ok == 0 {
            return Err(last_error(operation));
        }
        Ok(())
    }

    fn open_process(pid: u32, access: u32) -> IsolationResult<OwnedHandle> {
        let handle = unsafe { OpenProcess(access, 0, pid) };
        OwnedHandle::new(handle, "OpenProcess")
    }
}

impl JobBackend for Win32Job {
    fn query_extended_limits(&self) -> IsolationResult<RawExtendedLimits> {
        let info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION =
            self.query(JobObjectExtendedLimitInformation, "QueryInformationJobObject")?;
        let basic = &info.BasicLimitInformation;
        Ok(RawExtendedLimits {
            limit_flags: basic.LimitFlags,
            per_process_user_time_limit: basic.PerProcessUserTimeLimit,
            per_job_user_time_limit: basic.PerJobUserTimeLimit,
            minimum_working_set_size: basic.MinimumWorkingSetSize as u64,
            maximum_working_set_size: basic.MaximumWorkingSetSize as u64,
            active_process_limit: basic.ActiveProcessLimit,
            affinity: basic.Affinity as u64,
            priority_class: basic.PriorityClass,
            scheduling_class: basic.SchedulingClass,
            process_memory_limit: info.ProcessMemoryLimit as u64,
            job_memory_limit: info.JobMemoryLimit as u64,
            peak_process_memory_used: info.PeakProcessMemoryUsed as u64,
            peak_job_memory_used: info.PeakJobMemoryUsed as u64,
        })
    }

    fn set_extended_limits(&self, raw: &RawExtendedLimits) -> IsolationResult<()> {
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
        let basic = &mut info.BasicLimitInformation;
        basic.LimitFlags = raw.limit_flags;
        basic.PerProcessUserTimeLimit = raw.per_process_user_time_limit;
        basic.PerJobUserTimeLimit = raw.per_job_user_time_limit;
        basic.MinimumWorkingSetSize = raw.minimum_working_set_size as usize;
        basic.MaximumWorkingSetSize = raw.maximum_working_set_size as usize;
        basic.ActiveProcessLimit = raw.active_process_limit;
        basic.Affinity = raw.affinity as usize;
        basic.PriorityClass = raw.priority_class;
        basic.SchedulingClass = raw.scheduling_class;
        info.ProcessMemoryLimit = raw.process_memory_limit as usize;
        info.JobMemoryLimit = raw.job_memory_limit as usize;
        self.set(JobObjectExtendedLimitInformation, &info, "SetInformationJobObject")
    }

    fn query_cpu_rate(&self) -> IsolationResult<RawCpuRate> {
        let info: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION =
            self.query(JobObjectCpuRateControlInformation, "QueryInformationJobObject")?;
        // The union member in use follows from the control flags; reading
        // every view of a plain integer union is sound.
        let (cpu_rate, weight, min_rate, max_rate) = unsafe {
            (
                info.Anonymous.CpuRate,
                info.Anonymous.Weight,
                info.Anonymous.Anonymous.MinRate,
                info.Anonymous.Anonymous.MaxRate,
            )
        };
        Ok(RawCpuRate {
            control_flags: info.ControlFlags,
            cpu_rate,
            weight,
            min_rate,
            max_rate,
        })
    }

    fn set_cpu_rate(&self, raw: &RawCpuRate) -> IsolationResult<()> {
        use super::encoding::rate_flags;

        let mut info: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION = unsafe { mem::zeroed() };
        info.ControlFlags = raw.control_flags;
        if raw.control_flags & rate_flags::HARD_CAP != 0 {
            info.Anonymous.CpuRate = raw.cpu_rate;
        } else if raw.control_flags & rate_flags::WEIGHT_BASED != 0 {
            info.Anonymous.Weight = raw.weight;
        } else if raw.control_flags & rate_flags::MIN_MAX_RATE != 0 {
            info.Anonymous.Anonymous.MinRate = raw.min_rate;
            info.Anonymous.Anonymous.MaxRate = raw.max_rate;
        }
        self.set(JobObjectCpuRateControlInformation, &info, "SetInformationJobObject")
    }

    fn query_accounting(&self) -> IsolationResult<RawAccounting> {
        let info: JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION =
            self.query(JobObjectBasicAndIoAccountingInformation, "QueryInformationJobObject")?;
        Ok(RawAccounting {
            total_user_time: info.BasicInfo.TotalUserTime,
            total_kernel_time: info.BasicInfo.TotalKernelTime,
            read_operation_count: info.IoInfo.ReadOperationCount,
            write_operation_count: info.IoInfo.WriteOperationCount,
            other_operation_count: info.IoInfo.OtherOperationCount,
            read_transfer_count: info.IoInfo.ReadTransferCount,
            write_transfer_count: info.IoInfo.WriteTransferCount,
            other_transfer_count: info.IoInfo.OtherTransferCount,
        })
    }

    fn query_process_ids(&self, capacity: usize) -> IsolationResult<RawProcessIdList> {
        let ids_offset = mem::offset_of!(JOBOBJECT_BASIC_PROCESS_ID_LIST, ProcessIdList);
        let byte_len = ids_offset + capacity * mem::size_of::<usize>();
        // u64 storage keeps the buffer aligned for the usize id array.
        let mut buffer = vec![0u64; byte_len.div_ceil(mem::size_of::<u64>())];

        let ok = unsafe {
            QueryInformationJobObject(
                self.raw(),
                JobObjectBasicProcessIdList,
                buffer.as_mut_ptr() as *mut c_void,
                byte_len as u32,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_error("QueryInformationJobObject"));
        }

        let header = buffer.as_ptr() as *const JOBOBJECT_BASIC_PROCESS_ID_LIST;
        let (assigned, listed) = unsafe {
            (
                (*header).NumberOfAssignedProcesses,
                (*header).NumberOfProcessIdsInList as usize,
            )
        };
        let ids = unsafe {
            let first = (buffer.as_ptr() as *const u8).add(ids_offset) as *const usize;
            std::slice::from_raw_parts(first, listed.min(capacity))
        };

        Ok(RawProcessIdList {
            assigned,
            ids: ids.iter().map(|id| *id as u32).collect(),
        })
    }

    fn query_limit_violation(&self) -> IsolationResult<RawLimitViolation> {
        let info: JOBOBJECT_LIMIT_VIOLATION_INFORMATION =
            self.query(JobObjectLimitViolationInformation, "QueryInformationJobObject")?;
        Ok(RawLimitViolation {
            limit_flags: info.LimitFlags,
            violation_limit_flags: info.ViolationLimitFlags,
            io_read_bytes: info.IoReadBytes,
            io_read_bytes_limit: info.IoReadBytesLimit,
            io_write_bytes: info.IoWriteBytes,
            io_write_bytes_limit: info.IoWriteBytesLimit,
            per_job_user_time: info.PerJobUserTime,
            per_job_user_time_limit: info.PerJobUserTimeLimit,
            job_memory: info.JobMemory,
            job_memory_limit: info.JobMemoryLimit,
            rate_control_tolerance: info.RateControlTolerance as u32,
            rate_control_tolerance_limit: info.RateControlToleranceLimit as u32,
        })
    }

    fn assign_process(&self, pid: u32) -> IsolationResult<()> {
        let process = Self::open_process(pid, PROCESS_SET_QUOTA | PROCESS_TERMINATE)?;
        if unsafe { AssignProcessToJobObject(self.raw(), process.0) } == 0 {
            return Err(last_error("AssignProcessToJobObject"));
        }
        Ok(())
    }

    fn assign_current_process(&self) -> IsolationResult<()> {
        if unsafe { AssignProcessToJobObject(self.raw(), GetCurrentProcess()) } == 0 {
            return Err(last_error("AssignProcessToJobObject"));
        }
        Ok(())
    }

    fn contains_process(&self, pid: u32) -> IsolationResult<bool> {
        let process = Self::open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
        let mut result = 0;
        if unsafe { IsProcessInJob(process.0, self.raw(), &mut result) } == 0 {
            return Err(last_error("IsProcessInJob"));
        }
        Ok(result != 0)
    }

    fn terminate(&self, exit_code: u32) -> IsolationResult<()> {
        if unsafe { TerminateJobObject(self.raw(), exit_code) } == 0 {
            return Err(last_error("TerminateJobObject"));
        }
        Ok(())
    }

    fn attach_port(&self) -> IsolationResult<Box<dyn NotificationPort>> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        let port = OwnedHandle::new(port, "CreateIoCompletionPort")?;

        let association = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: ptr::null_mut(),
            CompletionPort: port.0,
        };
        self.set(
            JobObjectAssociateCompletionPortInformation,
            &association,
            "SetInformationJobObject",
        )?;
        Ok(Box::new(Win32Port(port)))
    }

    fn detach_port(&self) -> IsolationResult<()> {
        let association = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: ptr::null_mut(),
            CompletionPort: ptr::null_mut(),
        };
        self.set(
            JobObjectAssociateCompletionPortInformation,
            &association,
            "SetInformationJobObject",
        )
    }
}

struct Win32Port(OwnedHandle);

impl NotificationPort for Win32Port {
    fn dequeue(&self, timeout: Duration) -> IsolationResult<Option<RawNotification>> {
        let mut message_id = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.0.0,
                &mut message_id,
                &mut key,
                &mut overlapped,
                timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32,
            )
        };
        if ok == 0 {
            let error = unsafe { GetLastError() };
            if overlapped.is_null() && error != ERROR_ABANDONED_WAIT_0 {
                // Nothing arrived within the timeout.
                return Ok(None);
            }
            return Err(IsolationError::from_os_code("GetQueuedCompletionStatus", error));
        }

        // For process messages the overlapped slot carries the process id.
        let pid = overlapped as usize;
        Ok(Some(RawNotification {
            message_id,
            process_id: (pid != 0).then_some(pid as u32),
        }))
    }
}
